//! Structured errors crossing the host/VM boundary
//!
//! A [`LuaError`] records everything known at the failure site: the VM status
//! code, the message, a dump of the VM value stack, the VM call stack and the
//! host call stack. Because the VM's error channel only carries strings, the
//! record travels through it as JSON ([`LuaError::to_json`]) and is restored
//! by the next protected call up the chain ([`LuaError::parse`]). A layer that
//! manages to parse the error reuses it instead of capturing a new one, so the
//! host trace keeps pointing at the original failure site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One active VM frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuaStackEntry {
    /// Function name as reported by the VM (may be empty)
    pub name: String,
    /// Chunk the function was loaded from
    pub source: String,
    /// Printable form of `source`
    pub short_source: String,
    /// Line being executed
    #[serde(rename = "line")]
    pub current_line: i32,
}

/// One host frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStackEntry {
    /// Demangled function name
    #[serde(rename = "func")]
    pub name: String,
    /// Source file
    #[serde(rename = "file")]
    pub source: String,
    /// Line within `source`
    #[serde(rename = "line")]
    pub current_line: u32,
}

/// Structured failure record shared by VM errors, bridge misuse and host panics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuaError {
    /// Status code of the VM operation that failed (0 when raised by host code)
    pub code: i32,
    /// Error message
    pub message: String,
    /// VM value stack, top first
    #[serde(rename = "lua_stack")]
    pub lua_stack: Vec<String>,
    /// VM call stack, innermost first
    #[serde(rename = "lua_stacktrace")]
    pub lua_stacktrace: Vec<LuaStackEntry>,
    /// Host call stack, innermost first
    #[serde(rename = "host_stacktrace")]
    pub host_stacktrace: Vec<HostStackEntry>,
}

impl LuaError {
    /// Restore an error from its JSON form
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Encode the error for the VM's string error channel
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Error carrying only a code and a message, without any trace
    pub fn bare(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "lua error code: {}; {}", self.code, self.message)?;
        writeln!(f, "Lua current stack dump:")?;
        for entry in &self.lua_stack {
            f.write_str(entry)?;
        }
        writeln!(f, "Lua error stack trace:")?;
        for entry in &self.lua_stacktrace {
            writeln!(
                f,
                "  at {}( {}:{} )",
                entry.name, entry.source, entry.current_line
            )?;
        }
        writeln!(f, "Host error stack trace:")?;
        for entry in &self.host_stacktrace {
            writeln!(
                f,
                "  at {}( {}:{} )",
                entry.name, entry.source, entry.current_line
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for LuaError {}

/// Misuse detected by the bridge itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Handle is out of range or was unregistered
    #[error("Unknown registry handle {0}")]
    UnknownHandle(u32),

    /// Handle does not name a callable
    #[error("Requested execution of an unknown function")]
    UnknownFunction,

    /// Handle does not name a struct
    #[error("Registry handle {0} does not name a struct")]
    NotAStruct(u32),

    /// Struct has no field with this name
    #[error("Unknown field {0}")]
    UnknownField(String),

    /// VM value does not match the field's kind
    #[error("Wrong assignment to field {0}")]
    WrongAssignment(String),

    /// Field kind is outside the supported set
    #[error("Unsupported type of field {field}: {type_name}")]
    UnsupportedFieldType {
        /// Field name
        field: String,
        /// Declared type of the field
        type_name: String,
    },

    /// Field name passed by the VM is not a string
    #[error("Field name must be a string")]
    InvalidFieldName,

    /// Operation only valid on the main coroutine
    #[error("Operation requires the main coroutine")]
    NotMainState,

    /// Interpreter family was already closed
    #[error("Interpreter state is closed")]
    Closed,

    /// The VM could not allocate a new interpreter
    #[error("Failed to allocate a new interpreter state")]
    AllocationFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LuaError {
        LuaError {
            code: 2,
            message: "boom \"quoted\"\nsecond line".to_string(),
            lua_stack: vec![" String : \tboom\n".to_string()],
            lua_stacktrace: vec![LuaStackEntry {
                name: "f".to_string(),
                source: "@script.lua".to_string(),
                short_source: "script.lua".to_string(),
                current_line: 3,
            }],
            host_stacktrace: vec![HostStackEntry {
                name: "app::main".to_string(),
                source: "src/main.rs".to_string(),
                current_line: 10,
            }],
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let err = sample();
        let parsed = LuaError::parse(&err.to_json()).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_json_field_names() {
        let json = sample().to_json();
        for key in [
            "\"code\"",
            "\"message\"",
            "\"lua_stack\"",
            "\"lua_stacktrace\"",
            "\"host_stacktrace\"",
            "\"short_source\"",
            "\"func\"",
            "\"file\"",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }

    #[test]
    fn test_parse_rejects_plain_messages() {
        assert!(LuaError::parse("[string \"x\"]:1: attempt to call a nil value").is_err());
        assert!(LuaError::parse("").is_err());
    }

    #[test]
    fn test_display_sections() {
        let text = sample().to_string();
        assert!(text.starts_with("lua error code: 2; boom"));
        assert!(text.contains("Lua current stack dump:\n String : \tboom\n"));
        assert!(text.contains("Lua error stack trace:\n  at f( @script.lua:3 )\n"));
        assert!(text.contains("Host error stack trace:\n  at app::main( src/main.rs:10 )\n"));
    }

    #[test]
    fn test_bridge_error_messages() {
        assert_eq!(
            BridgeError::WrongAssignment("count".into()).to_string(),
            "Wrong assignment to field count"
        );
        assert_eq!(
            BridgeError::UnsupportedFieldType {
                field: "tags".into(),
                type_name: "alloc::vec::Vec<alloc::string::String>".into(),
            }
            .to_string(),
            "Unsupported type of field tags: alloc::vec::Vec<alloc::string::String>"
        );
    }
}
