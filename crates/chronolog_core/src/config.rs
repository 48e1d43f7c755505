//! Database configuration.

/// Default date mask for segment file names, one bucket per day.
pub const DEFAULT_FILENAME_MASK: &str = "%Y-%m-%d";

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether this handle requests the single-writer role.
    ///
    /// Exactly one process may be master per database; everyone else opens
    /// read-only and can scan but never append or write topic variables.
    pub master: bool,

    /// Whether to create the database if it doesn't exist (master only;
    /// a reader can never create a database).
    pub create_if_missing: bool,

    /// strftime-style mask turning a record time into its segment bucket
    /// name. The default partitions by calendar day.
    pub filename_mask: String,

    /// Format version to use for new databases.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master: false,
            create_if_missing: true,
            filename_mask: DEFAULT_FILENAME_MASK.to_string(),
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether this handle requests the single-writer role.
    #[must_use]
    pub fn master(mut self, value: bool) -> Self {
        self.master = value;
        self
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the segment filename mask.
    #[must_use]
    pub fn filename_mask(mut self, mask: impl Into<String>) -> Self {
        self.filename_mask = mask.into();
        self
    }
}
