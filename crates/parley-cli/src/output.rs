//! Output formatting for CLI results
//!
//! Three output formats:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting
//! - Quiet: No output, exit codes only

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use parley_core::policy::ToggleCapability;
use parley_core::{ConversationEncryptionState, ConversationId, Incoming, PlaceholderReason, ReceivedMessage};

use crate::ExitCode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<&'static str>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            exit_code: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: Some(command.to_string()),
        }
    }
}

impl JsonResponse<()> {
    pub fn error(message: &str, code: ExitCode) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            exit_code: Some(code.name()),
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: None,
        }
    }
}

/// Identity summary. The recovery code is only filled in when the user
/// asked to see it.
#[derive(Debug, Serialize)]
pub struct IdentityOutput {
    pub user_id: String,
    pub fingerprint: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub conversation_id: String,
    pub enabled: bool,
    pub enabled_by: Option<String>,
    pub timestamp: i64,
    pub can_enable: bool,
    pub can_disable: bool,
}

impl StatusOutput {
    pub fn new(
        conversation_id: &ConversationId,
        state: &ConversationEncryptionState,
        capability: &ToggleCapability,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            enabled: state.is_enabled(),
            enabled_by: state.owner().map(|o| o.to_string()),
            timestamp: state.timestamp,
            can_enable: capability.can_enable,
            can_disable: capability.can_disable,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageOutput {
    pub sender_id: String,
    pub sent_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<&'static str>,
}

impl From<&ReceivedMessage> for MessageOutput {
    fn from(m: &ReceivedMessage) -> Self {
        let (text, placeholder) = match &m.content {
            Incoming::Plaintext(t) => (Some(t.clone()), None),
            Incoming::Placeholder(reason) => (None, Some(placeholder_label(*reason))),
        };
        Self {
            sender_id: m.sender_id.to_string(),
            sent_at: format_millis(m.sent_at),
            text,
            placeholder,
        }
    }
}

fn placeholder_label(reason: PlaceholderReason) -> &'static str {
    match reason {
        PlaceholderReason::KeyUnavailable => "key_unavailable",
        PlaceholderReason::DecryptionFailed => "decryption_failed",
    }
}

pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    pub fn format_identity(&self, info: &IdentityOutput, command: &str) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = new_table();
                table.add_row(vec!["User ID", &info.user_id]);
                table.add_row(vec!["Fingerprint", &info.fingerprint]);
                table.add_row(vec!["Public Key", &info.public_key]);
                if let Some(code) = &info.recovery_code {
                    table.add_row(vec!["Recovery Code", code]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(info, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_status(&self, status: &StatusOutput, command: &str) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = new_table();
                table.add_row(vec!["Conversation", &status.conversation_id]);
                table.add_row(vec!["Encrypted", if status.enabled { "yes" } else { "no" }]);
                table.add_row(vec!["Enabled By", status.enabled_by.as_deref().unwrap_or("-")]);
                table.add_row(vec!["Changed At", &format_millis(status.timestamp)]);
                table.add_row(vec!["You Can Enable", yes_no(status.can_enable)]);
                table.add_row(vec!["You Can Disable", yes_no(status.can_disable)]);
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(status, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_messages(&self, messages: &[ReceivedMessage]) -> String {
        let rows: Vec<MessageOutput> = messages.iter().map(MessageOutput::from).collect();
        match self.format {
            OutputFormat::Table => {
                if rows.is_empty() {
                    return "No encrypted messages.".to_string();
                }
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Sent At", "From", "Message"]);
                for row in &rows {
                    let body = match (&row.text, row.placeholder) {
                        (Some(t), _) => t.clone(),
                        (None, Some(p)) => format!("[{p}]"),
                        (None, None) => String::new(),
                    };
                    table.add_row(vec![row.sent_at.as_str(), row.sender_id.as_str(), body.as_str()]);
                }
                table.to_string()
            }
            OutputFormat::Json => self.to_json_response(&rows, "read"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Generic data for commands without a dedicated table.
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Table => String::new(),
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_error(&self, message: &str, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("✗ {message}"),
            OutputFormat::Json => self.to_json(&JsonResponse::<()>::error(message, code)),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Only shown in verbose table mode.
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        match self.format {
            OutputFormat::Table => eprintln!("⚠ {message}"),
            OutputFormat::Json => eprintln!("{}", self.to_json(&serde_json::json!({ "warning": message }))),
            OutputFormat::Quiet => {}
        }
    }

    /// Print `text` unless it is empty.
    pub fn emit(&self, text: &str) {
        if !text.is_empty() {
            println!("{text}");
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success(value, command))
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Property", "Value"]);
    table
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn format_millis(millis: i64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis) {
        Some(_) if millis == 0 => "never".to_string(),
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => millis.to_string(),
    }
}
