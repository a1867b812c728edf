use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{invalid_argument, KinveyResult};

pub const ENTITY_ID_KEY: &str = "_id";
pub const ENTITY_ACL_KEY: &str = "_acl";
pub const ENTITY_METADATA_KEY: &str = "_kmd";

/// Prefix of ids generated on the device for entities the backend has not seen yet.
pub const TEMPORARY_ID_PREFIX: &str = "tmp_";

/// Generates a fresh temporary id (`tmp_<uuid>`).
pub fn generate_temporary_id() -> String {
    format!("{TEMPORARY_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_ID_PREFIX)
}

/// Formats a timestamp the way the backend writes `_kmd.lmt` / `_kmd.ect`.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Access control list of an entity (`_acl` on the wire).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<String>,
    #[serde(rename = "w", default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<String>,
    #[serde(rename = "gr", default, skip_serializing_if = "Option::is_none")]
    pub global_read: Option<bool>,
    #[serde(rename = "gw", default, skip_serializing_if = "Option::is_none")]
    pub global_write: Option<bool>,
    #[serde(default, skip_serializing_if = "AclGroups::is_empty")]
    pub groups: AclGroups,
}

impl Acl {
    pub fn with_creator(creator: impl Into<String>) -> Self {
        Self {
            creator: Some(creator.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclGroups {
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<String>,
    #[serde(rename = "w", default, skip_serializing_if = "Vec::is_empty")]
    pub writers: Vec<String>,
}

impl AclGroups {
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }
}

/// Backend bookkeeping attached to every entity (`_kmd` on the wire).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lmt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authtoken: Option<String>,
}

impl Metadata {
    /// Last modification time, when present and well formed.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.lmt.as_deref()?)
    }

    /// Entity creation time, when present and well formed.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.ect.as_deref()?)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// A record of a collection: user fields plus the reserved `_id`, `_acl` and `_kmd`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entity {
    id: Option<String>,
    acl: Option<Acl>,
    metadata: Option<Metadata>,
    fields: Map<String, Value>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Entities without an id are local-only and pending creation.
    pub fn is_local_only(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_temporary_id(&self) -> bool {
        self.id.as_deref().is_some_and(is_temporary_id)
    }

    /// Assigns the id of an entity that does not have one yet.
    ///
    /// Ids are immutable once assigned: re-assigning the same id is accepted, a
    /// different one is rejected.
    pub fn assign_id(&mut self, id: impl Into<String>) -> KinveyResult<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(invalid_argument("Entity id cannot be empty"));
        }
        match self.id.as_deref() {
            Some(existing) if existing != id => Err(invalid_argument(format!(
                "Entity id '{existing}' cannot be changed to '{id}'"
            ))),
            _ => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    /// Swaps a temporary id for the one the backend assigned.
    pub(crate) fn rekey(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    pub fn set_acl(&mut self, acl: Acl) {
        self.acl = Some(acl);
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = Some(metadata);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a user field; reserved keys must go through the typed accessors.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) -> KinveyResult<()> {
        let name = name.into();
        if is_reserved_key(&name) {
            return Err(invalid_argument(format!(
                "'{name}' is reserved and cannot be set as a plain field"
            )));
        }
        self.fields.insert(name, value.into());
        Ok(())
    }

    /// Resolves a dotted JSON path (`_id`, `_kmd.lmt`, `address.city`, ...).
    pub fn value_at(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let root = match first {
            ENTITY_ID_KEY => return self.id.clone().map(Value::String),
            ENTITY_ACL_KEY => serde_json::to_value(self.acl.as_ref()?).ok()?,
            ENTITY_METADATA_KEY => serde_json::to_value(self.metadata.as_ref()?).ok()?,
            other => self.fields.get(other)?.clone(),
        };
        segments.try_fold(root, |current, segment| match current {
            Value::Object(mut map) => map.remove(segment),
            _ => None,
        })
    }

    /// Decodes the backend JSON representation.
    pub fn from_json(value: Value) -> KinveyResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(invalid_argument("Entity JSON must be an object"));
        };
        let id = match map.remove(ENTITY_ID_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => Some(other.to_string()),
        };
        let acl = match map.remove(ENTITY_ACL_KEY) {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value(raw)?),
        };
        let metadata = match map.remove(ENTITY_METADATA_KEY) {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value(raw)?),
        };
        Ok(Self {
            id,
            acl,
            metadata,
            fields: map,
        })
    }

    /// Encodes the entity into its backend JSON representation.
    pub fn to_json(&self) -> Value {
        let mut map = self.fields.clone();
        if let Some(id) = &self.id {
            map.insert(ENTITY_ID_KEY.to_owned(), Value::String(id.clone()));
        }
        if let Some(acl) = &self.acl {
            if let Ok(value) = serde_json::to_value(acl) {
                map.insert(ENTITY_ACL_KEY.to_owned(), value);
            }
        }
        if let Some(metadata) = &self.metadata {
            if let Ok(value) = serde_json::to_value(metadata) {
                map.insert(ENTITY_METADATA_KEY.to_owned(), value);
            }
        }
        Value::Object(map)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Entity::from_json(value).map_err(serde::de::Error::custom)
    }
}

fn is_reserved_key(key: &str) -> bool {
    matches!(key, ENTITY_ID_KEY | ENTITY_ACL_KEY | ENTITY_METADATA_KEY)
}

/// How a mapped field is validated and normalised on its way to and from the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldCodec {
    String,
    Integer,
    Double,
    Boolean,
    /// RFC 3339 timestamp, normalised to millisecond precision in UTC.
    Date,
    /// Any JSON value, passed through untouched.
    Json,
}

impl FieldCodec {
    fn encode(self, field: &str, value: Value) -> KinveyResult<Value> {
        if value.is_null() {
            return Ok(value);
        }
        match self {
            FieldCodec::Date => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| codec_mismatch(field, "a date string", &value))?;
                let time = parse_timestamp(raw)
                    .ok_or_else(|| codec_mismatch(field, "an RFC 3339 date", &value))?;
                Ok(Value::String(format_timestamp(time)))
            }
            _ => {
                self.check(field, &value)?;
                Ok(value)
            }
        }
    }

    fn check(self, field: &str, value: &Value) -> KinveyResult<()> {
        let valid = match self {
            FieldCodec::String => value.is_string(),
            FieldCodec::Integer => value.is_i64() || value.is_u64(),
            FieldCodec::Double => value.is_number(),
            FieldCodec::Boolean => value.is_boolean(),
            FieldCodec::Date => value.as_str().and_then(parse_timestamp).is_some(),
            FieldCodec::Json => true,
        };
        if valid || value.is_null() {
            Ok(())
        } else {
            Err(codec_mismatch(field, self.describe(), value))
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FieldCodec::String => "a string",
            FieldCodec::Integer => "an integer",
            FieldCodec::Double => "a number",
            FieldCodec::Boolean => "a boolean",
            FieldCodec::Date => "an RFC 3339 date",
            FieldCodec::Json => "JSON",
        }
    }
}

fn codec_mismatch(field: &str, expected: &str, value: &Value) -> crate::error::KinveyError {
    invalid_argument(format!("Field '{field}' must be {expected}, got {value}"))
}

/// One row of an entity shape's mapping table: Rust field name, JSON key, codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub field: &'static str,
    pub json_key: &'static str,
    pub codec: FieldCodec,
}

impl FieldMapping {
    pub const fn new(field: &'static str, json_key: &'static str, codec: FieldCodec) -> Self {
        Self {
            field,
            json_key,
            codec,
        }
    }
}

/// Mappings every entity shape gets for free.
pub const RESERVED_FIELD_MAPPINGS: &[FieldMapping] = &[
    FieldMapping::new("id", ENTITY_ID_KEY, FieldCodec::String),
    FieldMapping::new("acl", ENTITY_ACL_KEY, FieldCodec::Json),
    FieldMapping::new("metadata", ENTITY_METADATA_KEY, FieldCodec::Json),
];

/// A typed entity shape stored in a collection.
///
/// The mapping table is the single source of truth for field names on the wire:
/// struct fields not listed keep their serde name, and `id` / `acl` / `metadata`
/// map onto the reserved keys automatically.
///
/// ```
/// use kinvey_rs_sdk::datastore::{FieldCodec, FieldMapping, Persistable};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Book {
///     #[serde(default, skip_serializing_if = "Option::is_none")]
///     id: Option<String>,
///     title: String,
///     published_at: Option<String>,
/// }
///
/// impl Persistable for Book {
///     fn collection_name() -> &'static str {
///         "Book"
///     }
///
///     fn field_mappings() -> &'static [FieldMapping] {
///         const MAPPINGS: &[FieldMapping] = &[
///             FieldMapping::new("title", "title", FieldCodec::String),
///             FieldMapping::new("published_at", "publishedAt", FieldCodec::Date),
///         ];
///         MAPPINGS
///     }
/// }
/// ```
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn collection_name() -> &'static str;

    fn field_mappings() -> &'static [FieldMapping] {
        &[]
    }

    fn to_entity(&self) -> KinveyResult<Entity> {
        encode_entity(self, Self::field_mappings())
    }

    fn from_entity(entity: &Entity) -> KinveyResult<Self> {
        decode_entity(entity, Self::field_mappings())
    }
}

/// Resolves a Rust field name (or dotted path) to its JSON key using the mapping table.
pub fn json_key_for(mappings: &[FieldMapping], field: &str) -> String {
    let (head, rest) = match field.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (field, None),
    };
    let key = find_by_field(mappings, head)
        .map(|mapping| mapping.json_key)
        .unwrap_or(head);
    match rest {
        Some(rest) => format!("{key}.{rest}"),
        None => key.to_owned(),
    }
}

/// Codec of the field stored under `json_key`, if the table declares one.
pub fn codec_for_key(mappings: &[FieldMapping], json_key: &str) -> Option<FieldCodec> {
    mappings
        .iter()
        .chain(RESERVED_FIELD_MAPPINGS)
        .find(|mapping| mapping.json_key == json_key)
        .map(|mapping| mapping.codec)
}

fn find_by_field<'a>(mappings: &'a [FieldMapping], field: &str) -> Option<&'a FieldMapping> {
    mappings
        .iter()
        .chain(RESERVED_FIELD_MAPPINGS)
        .find(|mapping| mapping.field == field)
}

fn find_by_key<'a>(mappings: &'a [FieldMapping], key: &str) -> Option<&'a FieldMapping> {
    mappings
        .iter()
        .chain(RESERVED_FIELD_MAPPINGS)
        .find(|mapping| mapping.json_key == key)
}

fn encode_entity<T: Serialize>(value: &T, mappings: &[FieldMapping]) -> KinveyResult<Entity> {
    let Value::Object(source) = serde_json::to_value(value)? else {
        return Err(invalid_argument("Persistable values must serialize to a JSON object"));
    };
    let mut wire = Map::with_capacity(source.len());
    for (field, raw) in source {
        match find_by_field(mappings, &field) {
            Some(mapping) => {
                let encoded = mapping.codec.encode(&field, raw)?;
                wire.insert(mapping.json_key.to_owned(), encoded);
            }
            None => {
                wire.insert(field, raw);
            }
        }
    }
    Entity::from_json(Value::Object(wire))
}

fn decode_entity<T: DeserializeOwned>(entity: &Entity, mappings: &[FieldMapping]) -> KinveyResult<T> {
    let Value::Object(wire) = entity.to_json() else {
        return Err(invalid_argument("Entity JSON must be an object"));
    };
    let mut source = Map::with_capacity(wire.len());
    for (key, raw) in wire {
        match find_by_key(mappings, &key) {
            Some(mapping) => {
                mapping.codec.check(mapping.field, &raw)?;
                source.insert(mapping.field.to_owned(), raw);
            }
            None => {
                source.insert(key, raw);
            }
        }
    }
    Ok(serde_json::from_value(Value::Object(source))?)
}
