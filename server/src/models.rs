//! Database models and closed vocabulary enums.
//!
//! Row structs map 1:1 to tables via `sqlx::FromRow`; the enums are the
//! closed sets that drive lifecycle decisions (state types, sender types,
//! permission keys, history types). Lifecycle logic branches on these enums,
//! never on display names.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

// Screen vocabulary for dynamic-field configuration (submodule)
pub mod screen;
pub use screen::ScreenName;

/// The authenticated acting identity supplied to every lifecycle call.
/// Constructed by the HTTP collaborator from the session; the core never
/// authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
}

impl Principal {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }

    /// The built-in system user (id 1), used by background workers.
    pub fn system() -> Self {
        Self { user_id: 1 }
    }
}

// =============================================================================
// Closed vocabularies
// =============================================================================

/// Classification of a ticket state. Drives every lifecycle decision;
/// state *names* are display-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    New,
    Open,
    PendingReminder,
    /// Auto-close into a "closed successful" state when `until_time` elapses.
    PendingAutoClosePlus,
    /// Auto-close into a "closed unsuccessful" state when `until_time` elapses.
    PendingAutoCloseMinus,
    Closed,
    Merged,
    Removed,
}

impl StateType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "new" => Some(Self::New),
            "open" => Some(Self::Open),
            "pending reminder" => Some(Self::PendingReminder),
            "pending auto close+" => Some(Self::PendingAutoClosePlus),
            "pending auto close-" => Some(Self::PendingAutoCloseMinus),
            "closed" => Some(Self::Closed),
            "merged" => Some(Self::Merged),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::PendingReminder => "pending reminder",
            Self::PendingAutoClosePlus => "pending auto close+",
            Self::PendingAutoCloseMinus => "pending auto close-",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::Removed => "removed",
        }
    }

    /// Pending states are the only states that carry an `until_time`.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingReminder | Self::PendingAutoClosePlus | Self::PendingAutoCloseMinus
        )
    }

    /// Auto-close pending states transition on their own when due.
    pub fn is_pending_auto(&self) -> bool {
        matches!(self, Self::PendingAutoClosePlus | Self::PendingAutoCloseMinus)
    }

    /// Merged and removed tickets count as closed for lifecycle purposes.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Merged | Self::Removed)
    }
}

/// Who authored an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderType {
    Agent,
    Customer,
    System,
}

impl SenderType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "agent" => Some(Self::Agent),
            "customer" => Some(Self::Customer),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Customer => "customer",
            Self::System => "system",
        }
    }
}

/// How a message entered or left the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Phone,
    Web,
    Api,
    Note,
}

impl Channel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            "web" => Some(Self::Web),
            "api" => Some(Self::Api),
            "note" => Some(Self::Note),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Web => "web",
            Self::Api => "api",
            Self::Note => "note",
        }
    }

    /// Default customer visibility of a ticket's first article per channel.
    /// Phone capture is an agent-side record; everything else originated
    /// from or is addressed to the customer.
    pub fn first_article_customer_visible(&self) -> bool {
        !matches!(self, Self::Phone | Self::Note)
    }
}

/// Per-group permission keys. `Rw` implies all others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKey {
    Ro,
    MoveInto,
    Create,
    Note,
    Owner,
    Priority,
    Rw,
}

impl PermissionKey {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ro" => Some(Self::Ro),
            "move_into" => Some(Self::MoveInto),
            "create" => Some(Self::Create),
            "note" => Some(Self::Note),
            "owner" => Some(Self::Owner),
            "priority" => Some(Self::Priority),
            "rw" => Some(Self::Rw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::MoveInto => "move_into",
            Self::Create => "create",
            Self::Note => "note",
            Self::Owner => "owner",
            Self::Priority => "priority",
            Self::Rw => "rw",
        }
    }
}

/// Audit event types written to `ticket_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    NewTicket,
    StateUpdate,
    OwnerUpdate,
    PriorityUpdate,
    QueueMove,
    AddNote,
    SetPendingTime,
    TimeAccounting,
    Merged,
    Reopened,
    AttachmentAdded,
    DynamicFieldSet,
}

impl HistoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTicket => "NewTicket",
            Self::StateUpdate => "StateUpdate",
            Self::OwnerUpdate => "OwnerUpdate",
            Self::PriorityUpdate => "PriorityUpdate",
            Self::QueueMove => "QueueMove",
            Self::AddNote => "AddNote",
            Self::SetPendingTime => "SetPendingTime",
            Self::TimeAccounting => "TimeAccounting",
            Self::Merged => "Merged",
            Self::Reopened => "Reopened",
            Self::AttachmentAdded => "AttachmentAdded",
            Self::DynamicFieldSet => "DynamicFieldSet",
        }
    }
}

// =============================================================================
// Identity & access rows
// =============================================================================

/// Maps to `users` table. Agents and system users; customers live in
/// `customer_user`.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub valid_id: i16,
    pub create_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
}

impl User {
    pub fn is_valid(&self) -> bool {
        self.valid_id == 1
    }

    /// System users (id 1 and 2) implicitly belong to the admin group.
    pub fn is_system(&self) -> bool {
        self.id <= 2
    }
}

/// Maps to `groups` table. The names "admin", "users" and "stats" are
/// system groups; they may be deactivated but never hard-deleted.
#[derive(Debug, Clone, FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub comments: Option<String>,
    pub valid_id: i16,
    pub create_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
}

impl Group {
    pub fn is_system_group(&self) -> bool {
        matches!(self.name.as_str(), "admin" | "users" | "stats")
    }
}

/// Maps to `group_user` table: one row per (user, group, key) grant.
#[derive(Debug, Clone, FromRow)]
pub struct GroupUser {
    pub user_id: i64,
    pub group_id: i64,
    pub permission_key: String,
    pub permission_value: i16,
}

// =============================================================================
// Lookup rows
// =============================================================================

/// Maps to `queue` table. A queue routes tickets to the agents of its group
/// and brands outbound mail with its system address.
#[derive(Debug, Clone, FromRow)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub system_address_id: Option<i64>,
    /// Initial state for tickets created in this queue; falls back to the
    /// system-wide new state when unset.
    pub default_state_id: Option<i64>,
    pub comments: Option<String>,
    pub valid_id: i16,
}

impl Queue {
    pub fn is_valid(&self) -> bool {
        self.valid_id == 1
    }
}

/// Maps to `ticket_state` joined with `ticket_state_type`; `type_name` is
/// the joined state-type name.
#[derive(Debug, Clone, FromRow)]
pub struct TicketState {
    pub id: i64,
    pub name: String,
    pub type_id: i64,
    pub type_name: String,
    pub valid_id: i16,
}

impl TicketState {
    pub fn state_type(&self) -> Option<StateType> {
        StateType::from_name(&self.type_name)
    }
}

/// Maps to `ticket_priority` table. Ordering by id ascending is lower to
/// higher urgency; names are display-only.
#[derive(Debug, Clone, FromRow)]
pub struct TicketPriority {
    pub id: i64,
    pub name: String,
    pub valid_id: i16,
}

/// Maps to `ticket_type` table.
#[derive(Debug, Clone, FromRow)]
pub struct TicketType {
    pub id: i64,
    pub name: String,
    pub valid_id: i16,
}

/// Maps to `service` table.
#[derive(Debug, Clone, FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub valid_id: i16,
}

/// Maps to `sla` table.
#[derive(Debug, Clone, FromRow)]
pub struct Sla {
    pub id: i64,
    pub name: String,
    pub valid_id: i16,
}

/// Maps to `system_address` table: a reply-from identity for queue-branded
/// outbound mail.
#[derive(Debug, Clone, FromRow)]
pub struct SystemAddress {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub valid_id: i16,
}

impl SystemAddress {
    /// RFC-5322 mailbox form, e.g. `Support <support@example.com>`.
    pub fn mailbox(&self) -> String {
        if self.display_name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", self.display_name, self.email)
        }
    }
}

// =============================================================================
// Customer directory rows (read-only from the lifecycle engine)
// =============================================================================

/// Maps to `customer_user` table; looked up by login.
#[derive(Debug, Clone, FromRow)]
pub struct CustomerUser {
    pub login: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub customer_id: Option<String>,
    pub valid_id: i16,
}

/// Maps to `customer_company` table.
#[derive(Debug, Clone, FromRow)]
pub struct CustomerCompany {
    pub customer_id: String,
    pub name: String,
    pub valid_id: i16,
}

// =============================================================================
// Ticket core rows
// =============================================================================

/// Maps to `ticket` table.
///
/// `until_time` is seconds since epoch; 0 means no pending time. It is
/// non-zero iff the current state's type is pending.
#[derive(Debug, Clone, FromRow)]
pub struct Ticket {
    pub id: i64,
    pub tn: String,
    pub title: String,
    pub queue_id: i64,
    pub state_id: i64,
    pub priority_id: i64,
    pub type_id: Option<i64>,
    pub service_id: Option<i64>,
    pub sla_id: Option<i64>,
    pub owner_user_id: Option<i64>,
    pub responsible_user_id: Option<i64>,
    pub customer_user_id: Option<String>,
    pub customer_id: Option<String>,
    pub until_time: i64,
    pub archive_flag: bool,
    pub create_time: DateTime<Utc>,
    pub create_by: i64,
    pub change_time: DateTime<Utc>,
    pub change_by: i64,
}

impl Ticket {
    pub fn has_pending_time(&self) -> bool {
        self.until_time > 0
    }

    /// The user reminders are addressed to: the owner, falling back to the
    /// responsible agent.
    pub fn reminder_recipient(&self) -> Option<i64> {
        self.owner_user_id.or(self.responsible_user_id)
    }
}

/// Maps to `ticket_history` table. Append-only.
#[derive(Debug, Clone, FromRow)]
pub struct TicketHistory {
    pub id: i64,
    pub ticket_id: i64,
    pub article_id: Option<i64>,
    pub history_type: String,
    pub name: String,
    pub create_time: DateTime<Utc>,
    pub create_by: i64,
}

/// Maps to `time_accounting` table. Append-only, positive minutes.
#[derive(Debug, Clone, FromRow)]
pub struct TimeAccounting {
    pub id: i64,
    pub ticket_id: i64,
    pub article_id: Option<i64>,
    pub time_unit: i32,
    pub create_time: DateTime<Utc>,
    pub create_by: i64,
}

// =============================================================================
// Article rows
// =============================================================================

/// Maps to `article` table (control columns; the MIME payload lives in
/// `article_data_mime`).
#[derive(Debug, Clone, FromRow)]
pub struct Article {
    pub id: i64,
    pub ticket_id: i64,
    pub subject: Option<String>,
    pub sender_type: String,
    pub channel: String,
    pub is_visible_for_customer: bool,
    pub is_first_article: bool,
    pub create_time: DateTime<Utc>,
    pub create_by: i64,
    pub change_time: DateTime<Utc>,
    pub change_by: i64,
}

impl Article {
    pub fn sender(&self) -> Option<SenderType> {
        SenderType::from_name(&self.sender_type)
    }
}

/// Maps to `article_data_mime` table: the message payload and envelope.
#[derive(Debug, Clone, FromRow)]
pub struct ArticleDataMime {
    pub article_id: i64,
    pub a_from: Option<String>,
    pub a_to: Option<String>,
    pub a_subject: Option<String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Best renderable form of an article body, selected by content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderableBody {
    Plain(String),
    Markdown(String),
    Html(String),
}

impl ArticleDataMime {
    /// Select the best renderable form for the stored body. Unknown or
    /// non-UTF-8 content degrades to a lossy plaintext rendering.
    pub fn renderable_body(&self) -> RenderableBody {
        let text = String::from_utf8_lossy(&self.body).into_owned();
        let mime = self
            .content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/html" => RenderableBody::Html(text),
            "text/markdown" => RenderableBody::Markdown(text),
            _ => RenderableBody::Plain(text),
        }
    }
}

/// Maps to `article_attachment` table.
#[derive(Debug, Clone, FromRow)]
pub struct ArticleAttachment {
    pub id: i64,
    pub article_id: i64,
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
    pub size: i64,
}

// =============================================================================
// Mail queue row
// =============================================================================

/// Maps to `mail_queue` table. `raw_message` is a fully assembled RFC-5322
/// message; the drain worker records SMTP outcomes here.
#[derive(Debug, Clone, FromRow)]
pub struct MailQueueItem {
    pub id: String,
    pub article_id: Option<i64>,
    pub sender: String,
    pub recipient: String,
    pub raw_message: Vec<u8>,
    pub attempts: i32,
    pub due_time: Option<DateTime<Utc>>,
    pub last_smtp_code: Option<i32>,
    pub last_smtp_message: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl MailQueueItem {
    /// A 2xx code means the transport accepted the message; the row is
    /// never re-selected by the worker.
    pub fn is_sent(&self) -> bool {
        matches!(self.last_smtp_code, Some(code) if (200..300).contains(&code))
    }

    /// A 5xx code parks the row until an operator retries it.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(self.last_smtp_code, Some(code) if code >= 500)
    }
}

// =============================================================================
// Dynamic field rows
// =============================================================================

/// Maps to `dynamic_field` table: a typed custom attribute definition.
#[derive(Debug, Clone, FromRow)]
pub struct DynamicField {
    pub id: i64,
    pub name: String,
    pub label: String,
    pub field_type: String,
    pub object_type: String,
    pub config: serde_json::Value,
    pub valid_id: i16,
}

/// Maps to `dynamic_field_value` table. Multi-value fields store one row
/// per entry; the typed columns mirror the field type.
#[derive(Debug, Clone, FromRow)]
pub struct DynamicFieldValue {
    pub id: i64,
    pub field_id: i64,
    pub object_type: String,
    pub object_id: i64,
    pub value_text: Option<String>,
    pub value_int: Option<i64>,
    pub value_date: Option<DateTime<Utc>>,
}

/// Maps to `screen_config` table: which fields a screen shows and requires.
#[derive(Debug, Clone, FromRow)]
pub struct ScreenConfigRow {
    pub screen_name: String,
    pub field_id: i64,
    pub visible: bool,
    pub required: bool,
    pub default_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_type_round_trip() {
        for st in [
            StateType::New,
            StateType::Open,
            StateType::PendingReminder,
            StateType::PendingAutoClosePlus,
            StateType::PendingAutoCloseMinus,
            StateType::Closed,
            StateType::Merged,
            StateType::Removed,
        ] {
            assert_eq!(StateType::from_name(st.as_str()), Some(st));
        }
        assert_eq!(StateType::from_name("Open"), None);
        assert_eq!(StateType::from_name(""), None);
    }

    #[test]
    fn test_state_type_classification() {
        assert!(StateType::PendingReminder.is_pending());
        assert!(StateType::PendingAutoClosePlus.is_pending());
        assert!(StateType::PendingAutoCloseMinus.is_pending());
        assert!(!StateType::Open.is_pending());

        assert!(StateType::PendingAutoClosePlus.is_pending_auto());
        assert!(!StateType::PendingReminder.is_pending_auto());

        assert!(StateType::Closed.is_closed());
        assert!(StateType::Merged.is_closed());
        assert!(StateType::Removed.is_closed());
        assert!(!StateType::New.is_closed());
    }

    #[test]
    fn test_channel_visibility_policy() {
        assert!(Channel::Email.first_article_customer_visible());
        assert!(Channel::Web.first_article_customer_visible());
        assert!(Channel::Api.first_article_customer_visible());
        assert!(!Channel::Phone.first_article_customer_visible());
        assert!(!Channel::Note.first_article_customer_visible());
    }

    #[test]
    fn test_permission_key_names() {
        for key in [
            PermissionKey::Ro,
            PermissionKey::MoveInto,
            PermissionKey::Create,
            PermissionKey::Note,
            PermissionKey::Owner,
            PermissionKey::Priority,
            PermissionKey::Rw,
        ] {
            assert_eq!(PermissionKey::from_name(key.as_str()), Some(key));
        }
        assert_eq!(PermissionKey::from_name("write"), None);
    }

    #[test]
    fn test_renderable_body_selection() {
        let mut mime = ArticleDataMime {
            article_id: 1,
            a_from: None,
            a_to: None,
            a_subject: None,
            content_type: "text/html; charset=utf-8".to_string(),
            body: b"<p>hi</p>".to_vec(),
        };
        assert_eq!(
            mime.renderable_body(),
            RenderableBody::Html("<p>hi</p>".to_string())
        );

        mime.content_type = "text/markdown".to_string();
        mime.body = b"**hi**".to_vec();
        assert_eq!(
            mime.renderable_body(),
            RenderableBody::Markdown("**hi**".to_string())
        );

        mime.content_type = "text/plain".to_string();
        mime.body = b"hi".to_vec();
        assert_eq!(mime.renderable_body(), RenderableBody::Plain("hi".to_string()));

        mime.content_type = "application/octet-stream".to_string();
        assert!(matches!(mime.renderable_body(), RenderableBody::Plain(_)));
    }

    #[test]
    fn test_mail_queue_item_classification() {
        let mut item = MailQueueItem {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            article_id: None,
            sender: "support@example.com".to_string(),
            recipient: "john@example.com".to_string(),
            raw_message: Vec::new(),
            attempts: 0,
            due_time: None,
            last_smtp_code: None,
            last_smtp_message: None,
            create_time: Utc::now(),
        };
        assert!(!item.is_sent());
        assert!(!item.is_permanent_failure());

        item.last_smtp_code = Some(250);
        assert!(item.is_sent());

        item.last_smtp_code = Some(451);
        assert!(!item.is_sent());
        assert!(!item.is_permanent_failure());

        item.last_smtp_code = Some(550);
        assert!(item.is_permanent_failure());
    }

    #[test]
    fn test_system_address_mailbox() {
        let addr = SystemAddress {
            id: 1,
            email: "support@example.com".to_string(),
            display_name: "Support".to_string(),
            valid_id: 1,
        };
        assert_eq!(addr.mailbox(), "Support <support@example.com>");

        let bare = SystemAddress {
            display_name: String::new(),
            ..addr
        };
        assert_eq!(bare.mailbox(), "support@example.com");
    }

    #[test]
    fn test_reminder_recipient_fallback() {
        let mut ticket = Ticket {
            id: 1,
            tn: "20260801120000".to_string(),
            title: "t".to_string(),
            queue_id: 1,
            state_id: 1,
            priority_id: 3,
            type_id: None,
            service_id: None,
            sla_id: None,
            owner_user_id: Some(7),
            responsible_user_id: Some(9),
            customer_user_id: None,
            customer_id: None,
            until_time: 0,
            archive_flag: false,
            create_time: Utc::now(),
            create_by: 1,
            change_time: Utc::now(),
            change_by: 1,
        };
        assert_eq!(ticket.reminder_recipient(), Some(7));
        ticket.owner_user_id = None;
        assert_eq!(ticket.reminder_recipient(), Some(9));
        ticket.responsible_user_id = None;
        assert_eq!(ticket.reminder_recipient(), None);
    }

    #[test]
    fn test_system_group_names() {
        let now = Utc::now();
        let mk = |name: &str| Group {
            id: 1,
            name: name.to_string(),
            comments: None,
            valid_id: 1,
            create_time: now,
            change_time: now,
        };
        assert!(mk("admin").is_system_group());
        assert!(mk("users").is_system_group());
        assert!(mk("stats").is_system_group());
        assert!(!mk("support").is_system_group());
    }
}
