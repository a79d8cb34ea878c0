//! Options for creating a main interpreter

/// Options for [`State::with_options`](crate::State::with_options)
#[derive(Debug, Clone)]
pub struct StateOptions {
    /// Open the standard libraries
    pub open_libs: bool,

    /// Maximum live heap size in bytes (None = unlimited)
    pub memory_limit: Option<usize>,

    /// Instructions a script may run before it is aborted (None = unlimited)
    pub execution_limit: Option<i32>,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            open_libs: true,
            memory_limit: None,
            execution_limit: None,
        }
    }
}

impl StateOptions {
    /// Options for an interpreter without standard libraries
    pub fn bare() -> Self {
        Self {
            open_libs: false,
            ..Default::default()
        }
    }

    /// Set whether the standard libraries are opened
    pub fn with_libs(mut self, open_libs: bool) -> Self {
        self.open_libs = open_libs;
        self
    }

    /// Cap the VM heap at `bytes`
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Abort scripts after `instructions` VM instructions
    pub fn with_execution_limit(mut self, instructions: i32) -> Self {
        self.execution_limit = Some(instructions);
        self
    }
}
