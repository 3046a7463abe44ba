//! Dynamic fields: per-screen, per-object typed custom attributes.
//!
//! Definitions and the screen configuration load once per process and are
//! cached; values are written alongside their owner in the caller's
//! transaction. Multi-value fields store one value row per entry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use sqlx::{Postgres, Transaction};
use tokio::sync::RwLock;
use tracing::info;

use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::models::{DynamicFieldValue, ScreenName};

/// The closed set of field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Textarea,
    Date,
    Datetime,
    Select,
    Multiselect,
    Checkbox,
}

impl FieldType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "textarea" => Some(Self::Textarea),
            "date" => Some(Self::Date),
            "datetime" => Some(Self::Datetime),
            "select" => Some(Self::Select),
            "multiselect" => Some(Self::Multiselect),
            "checkbox" => Some(Self::Checkbox),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Textarea => "textarea",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Select => "select",
            Self::Multiselect => "multiselect",
            Self::Checkbox => "checkbox",
        }
    }
}

/// What a field attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Ticket,
    Article,
}

impl ObjectType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ticket" => Some(Self::Ticket),
            "article" => Some(Self::Article),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticket => "ticket",
            Self::Article => "article",
        }
    }
}

/// A typed dynamic-field value as handled by the lifecycle paths.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Datetime(DateTime<Utc>),
    Bool(bool),
    List(Vec<String>),
}

/// Typed options from the definition's `config` JSON column.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

/// A resolved field definition.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: i64,
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub object_type: ObjectType,
    pub config: FieldConfig,
}

/// One screen's view of a field.
#[derive(Debug, Clone)]
pub struct ScreenField {
    pub field_id: i64,
    pub visible: bool,
    pub required: bool,
    pub default_value: Option<String>,
}

/// A value normalized to its storage rows.
#[derive(Debug, Clone)]
pub struct PreparedValue {
    pub field_id: i64,
    pub rows: Vec<ValueRow>,
}

#[derive(Debug, Clone, Default)]
pub struct ValueRow {
    pub value_text: Option<String>,
    pub value_int: Option<i64>,
    pub value_date: Option<DateTime<Utc>>,
}

/// Immutable definitions + screen schema.
pub struct FieldSchema {
    by_id: HashMap<i64, FieldDef>,
    by_name: HashMap<String, i64>,
    screens: HashMap<ScreenName, Vec<ScreenField>>,
}

impl FieldSchema {
    pub fn from_parts(fields: Vec<FieldDef>, screen_rows: Vec<(ScreenName, ScreenField)>) -> Self {
        let by_name = fields.iter().map(|f| (f.name.clone(), f.id)).collect();
        let by_id = fields.into_iter().map(|f| (f.id, f)).collect();
        let mut screens: HashMap<ScreenName, Vec<ScreenField>> = HashMap::new();
        for (screen, field) in screen_rows {
            screens.entry(screen).or_default().push(field);
        }
        Self {
            by_id,
            by_name,
            screens,
        }
    }

    pub fn field(&self, id: i64) -> Option<&FieldDef> {
        self.by_id.get(&id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// The per-screen schema: visible fields in configuration order.
    pub fn screen_fields(&self, screen: ScreenName) -> &[ScreenField] {
        self.screens.get(&screen).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate and normalize the submitted values for one screen. Unknown
    /// field names are rejected; required fields missing after defaults are
    /// rejected; each value is normalized to its storage rows.
    pub fn validate_for_screen(
        &self,
        screen: ScreenName,
        object_type: ObjectType,
        inputs: &HashMap<String, FieldValue>,
    ) -> Result<Vec<PreparedValue>> {
        let screen_fields = self.screen_fields(screen);
        let on_screen: HashMap<i64, &ScreenField> =
            screen_fields.iter().map(|sf| (sf.field_id, sf)).collect();

        // Reject unknown names and fields not configured for this screen.
        for name in inputs.keys() {
            let field = self
                .field_by_name(name)
                .ok_or_else(|| Error::validation(format!("unknown dynamic field '{}'", name)))?;
            if !on_screen.contains_key(&field.id) {
                return Err(Error::validation(format!(
                    "dynamic field '{}' is not configured for screen {}",
                    name,
                    screen.as_str()
                )));
            }
            if field.object_type != object_type {
                return Err(Error::validation(format!(
                    "dynamic field '{}' does not attach to {}",
                    name,
                    object_type.as_str()
                )));
            }
        }

        let mut prepared = Vec::new();
        for sf in screen_fields {
            if !sf.visible {
                continue;
            }
            let Some(field) = self.field(sf.field_id) else {
                return Err(Error::internal("screen references unknown dynamic field"));
            };
            // Screens mix ticket and article fields; only the requested
            // owner's fields are validated and written here.
            if field.object_type != object_type {
                continue;
            }

            let submitted = inputs.get(&field.name).cloned();
            let effective = match submitted {
                Some(value) => Some(value),
                None => sf
                    .default_value
                    .as_deref()
                    .or(field.config.default_value.as_deref())
                    .and_then(|raw| parse_default(field.field_type, raw)),
            };

            match effective {
                Some(value) => {
                    let rows = encode_value(field, &value)?;
                    prepared.push(PreparedValue {
                        field_id: field.id,
                        rows,
                    });
                }
                None if sf.required => {
                    return Err(Error::validation(format!(
                        "dynamic field '{}' is required on screen {}",
                        field.name,
                        screen.as_str()
                    )));
                }
                None => {}
            }
        }
        Ok(prepared)
    }

    /// Decode stored rows back into typed values, keyed by field name.
    pub fn decode_values(&self, rows: &[DynamicFieldValue]) -> HashMap<String, FieldValue> {
        let mut grouped: HashMap<i64, Vec<&DynamicFieldValue>> = HashMap::new();
        for row in rows {
            grouped.entry(row.field_id).or_default().push(row);
        }

        let mut out = HashMap::new();
        for (field_id, rows) in grouped {
            let Some(field) = self.field(field_id) else {
                continue;
            };
            let value = match field.field_type {
                FieldType::Multiselect => FieldValue::List(
                    rows.iter()
                        .filter_map(|r| r.value_text.clone())
                        .collect(),
                ),
                FieldType::Checkbox => {
                    FieldValue::Bool(rows[0].value_int.unwrap_or(0) != 0)
                }
                FieldType::Date | FieldType::Datetime => match rows[0].value_date {
                    Some(dt) => FieldValue::Datetime(dt),
                    None => continue,
                },
                _ => match rows[0].value_text.clone() {
                    Some(text) => FieldValue::Text(text),
                    None => continue,
                },
            };
            out.insert(field.name.clone(), value);
        }
        out
    }
}

/// Normalize one typed value to its storage rows, checking it against the
/// field definition.
fn encode_value(field: &FieldDef, value: &FieldValue) -> Result<Vec<ValueRow>> {
    let type_mismatch = || {
        Error::validation(format!(
            "dynamic field '{}' expects a {} value",
            field.name,
            field.field_type.as_str()
        ))
    };

    match (field.field_type, value) {
        (FieldType::Text | FieldType::Textarea, FieldValue::Text(text)) => Ok(vec![ValueRow {
            value_text: Some(text.clone()),
            ..Default::default()
        }]),
        (FieldType::Date | FieldType::Datetime, FieldValue::Datetime(dt)) => Ok(vec![ValueRow {
            value_date: Some(*dt),
            ..Default::default()
        }]),
        (FieldType::Checkbox, FieldValue::Bool(flag)) => Ok(vec![ValueRow {
            value_int: Some(i64::from(*flag)),
            ..Default::default()
        }]),
        (FieldType::Select, FieldValue::Text(choice)) => {
            if !field.config.options.is_empty() && !field.config.options.contains(choice) {
                return Err(Error::validation(format!(
                    "'{}' is not an option of dynamic field '{}'",
                    choice, field.name
                )));
            }
            Ok(vec![ValueRow {
                value_text: Some(choice.clone()),
                ..Default::default()
            }])
        }
        (FieldType::Multiselect, FieldValue::List(choices)) => {
            for choice in choices {
                if !field.config.options.is_empty() && !field.config.options.contains(choice) {
                    return Err(Error::validation(format!(
                        "'{}' is not an option of dynamic field '{}'",
                        choice, field.name
                    )));
                }
            }
            Ok(choices
                .iter()
                .map(|choice| ValueRow {
                    value_text: Some(choice.clone()),
                    ..Default::default()
                })
                .collect())
        }
        _ => Err(type_mismatch()),
    }
}

/// Parse a screen/config default string into a typed value.
fn parse_default(field_type: FieldType, raw: &str) -> Option<FieldValue> {
    match field_type {
        FieldType::Text | FieldType::Textarea | FieldType::Select => {
            Some(FieldValue::Text(raw.to_string()))
        }
        FieldType::Multiselect => Some(FieldValue::List(
            raw.split(',').map(|s| s.trim().to_string()).collect(),
        )),
        FieldType::Checkbox => Some(FieldValue::Bool(raw == "1" || raw == "true")),
        FieldType::Date | FieldType::Datetime => {
            crate::util::parse_pending_until(raw).map(FieldValue::Datetime)
        }
    }
}

/// Process-wide registry with explicit invalidation.
pub struct FieldRegistry {
    pool: DbPool,
    schema: RwLock<Option<Arc<FieldSchema>>>,
}

impl FieldRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            schema: RwLock::new(None),
        }
    }

    pub async fn schema(&self) -> Result<Arc<FieldSchema>> {
        if let Some(schema) = self.schema.read().await.as_ref() {
            return Ok(Arc::clone(schema));
        }

        let mut guard = self.schema.write().await;
        if let Some(schema) = guard.as_ref() {
            return Ok(Arc::clone(schema));
        }

        let schema = Arc::new(self.load().await?);
        *guard = Some(Arc::clone(&schema));
        info!("Dynamic field definitions loaded");
        Ok(schema)
    }

    pub async fn invalidate(&self) {
        *self.schema.write().await = None;
        info!("Dynamic field registry invalidated");
    }

    async fn load(&self) -> Result<FieldSchema> {
        let mut fields = Vec::new();
        for row in db::list_dynamic_fields(&self.pool).await? {
            let Some(field_type) = FieldType::from_name(&row.field_type) else {
                return Err(Error::internal(format!(
                    "dynamic field '{}' has unknown type '{}'",
                    row.name, row.field_type
                )));
            };
            let Some(object_type) = ObjectType::from_name(&row.object_type) else {
                return Err(Error::internal(format!(
                    "dynamic field '{}' has unknown object type '{}'",
                    row.name, row.object_type
                )));
            };
            let config: FieldConfig =
                serde_json::from_value(row.config.clone()).unwrap_or_default();
            fields.push(FieldDef {
                id: row.id,
                name: row.name,
                label: row.label,
                field_type,
                object_type,
                config,
            });
        }

        let mut screen_rows = Vec::new();
        for row in db::list_screen_config(&self.pool).await? {
            let Some(screen) = ScreenName::from_name(&row.screen_name) else {
                // Stale configuration rows are skipped, not fatal.
                continue;
            };
            screen_rows.push((
                screen,
                ScreenField {
                    field_id: row.field_id,
                    visible: row.visible,
                    required: row.required,
                    default_value: row.default_value,
                },
            ));
        }

        Ok(FieldSchema::from_parts(fields, screen_rows))
    }
}

/// Write the prepared values of one object inside the caller's transaction,
/// replacing any previous rows per field.
pub async fn write_values(
    txn: &mut Transaction<'_, Postgres>,
    object_type: ObjectType,
    object_id: i64,
    values: &[PreparedValue],
) -> sqlx::Result<()> {
    for value in values {
        db::delete_dynamic_field_values(txn, value.field_id, object_type.as_str(), object_id)
            .await?;
        for row in &value.rows {
            db::insert_dynamic_field_value(
                txn,
                value.field_id,
                object_type.as_str(),
                object_id,
                row.value_text.as_deref(),
                row.value_int,
                row.value_date,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(id: i64, name: &str, field_type: FieldType, options: &[&str]) -> FieldDef {
        FieldDef {
            id,
            name: name.to_string(),
            label: name.to_string(),
            field_type,
            object_type: ObjectType::Ticket,
            config: FieldConfig {
                options: options.iter().map(|s| s.to_string()).collect(),
                default_value: None,
            },
        }
    }

    fn screen_field(field_id: i64, required: bool, default_value: Option<&str>) -> ScreenField {
        ScreenField {
            field_id,
            visible: true,
            required,
            default_value: default_value.map(|s| s.to_string()),
        }
    }

    fn schema() -> FieldSchema {
        FieldSchema::from_parts(
            vec![
                field(1, "environment", FieldType::Select, &["prod", "staging"]),
                field(2, "affected_hosts", FieldType::Multiselect, &[]),
                field(3, "escalated", FieldType::Checkbox, &[]),
                field(4, "notes", FieldType::Textarea, &[]),
            ],
            vec![
                (ScreenName::AgentTicketEmail, screen_field(1, true, None)),
                (ScreenName::AgentTicketEmail, screen_field(2, false, None)),
                (ScreenName::AgentTicketEmail, screen_field(3, false, Some("1"))),
                (ScreenName::AgentTicketNote, screen_field(4, false, None)),
            ],
        )
    }

    #[test]
    fn test_unknown_field_rejected() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("no_such_field".to_string(), FieldValue::Text("x".into()));
        let err = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");
    }

    #[test]
    fn test_field_not_on_screen_rejected() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("notes".to_string(), FieldValue::Text("x".into()));
        // `notes` is configured for AgentTicketNote only.
        let err = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");
    }

    #[test]
    fn test_required_field_missing_rejected() {
        let schema = schema();
        let err = schema
            .validate_for_screen(
                ScreenName::AgentTicketEmail,
                ObjectType::Ticket,
                &HashMap::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");
        assert!(err.to_string().contains("environment"));
    }

    #[test]
    fn test_select_option_validation() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("environment".to_string(), FieldValue::Text("qa".into()));
        let err = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");

        inputs.insert("environment".to_string(), FieldValue::Text("prod".into()));
        assert!(schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .is_ok());
    }

    #[test]
    fn test_multiselect_expands_to_rows() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("environment".to_string(), FieldValue::Text("prod".into()));
        inputs.insert(
            "affected_hosts".to_string(),
            FieldValue::List(vec!["web1".into(), "web2".into(), "db1".into()]),
        );
        let prepared = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap();
        let hosts = prepared.iter().find(|p| p.field_id == 2).unwrap();
        assert_eq!(hosts.rows.len(), 3);
        assert_eq!(hosts.rows[0].value_text.as_deref(), Some("web1"));
    }

    #[test]
    fn test_screen_default_applied() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("environment".to_string(), FieldValue::Text("prod".into()));
        let prepared = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap();
        // `escalated` defaults to checked via its screen default.
        let escalated = prepared.iter().find(|p| p.field_id == 3).unwrap();
        assert_eq!(escalated.rows[0].value_int, Some(1));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = schema();
        let mut inputs = HashMap::new();
        inputs.insert("environment".to_string(), FieldValue::Bool(true));
        let err = schema
            .validate_for_screen(ScreenName::AgentTicketEmail, ObjectType::Ticket, &inputs)
            .unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");
    }

    #[test]
    fn test_decode_round_trip() {
        let schema = schema();
        let rows = vec![
            DynamicFieldValue {
                id: 1,
                field_id: 2,
                object_type: "ticket".to_string(),
                object_id: 9,
                value_text: Some("web1".to_string()),
                value_int: None,
                value_date: None,
            },
            DynamicFieldValue {
                id: 2,
                field_id: 2,
                object_type: "ticket".to_string(),
                object_id: 9,
                value_text: Some("web2".to_string()),
                value_int: None,
                value_date: None,
            },
            DynamicFieldValue {
                id: 3,
                field_id: 3,
                object_type: "ticket".to_string(),
                object_id: 9,
                value_text: None,
                value_int: Some(1),
                value_date: None,
            },
        ];
        let decoded = schema.decode_values(&rows);
        assert_eq!(
            decoded.get("affected_hosts"),
            Some(&FieldValue::List(vec!["web1".into(), "web2".into()]))
        );
        assert_eq!(decoded.get("escalated"), Some(&FieldValue::Bool(true)));
    }
}
