use serde::Deserialize;

use crate::error::Result;

/// Options recognised by the graph builders.
///
/// Parsed from a JSON object; every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Backend name; `<target>.` is stripped from local composite names.
    pub target: String,
    /// Decimal digits used when printing floating scalar constants.
    pub float_precision: usize,
    /// Prefer binding variable names over `span.name` for bound nodes.
    pub use_var_name: bool,
    pub input_aliases: Vec<String>,
    pub output_aliases: Vec<String>,
    /// Function to lower instead of the entry when the entry wraps a backend partition.
    pub byoc_entry: Option<String>,
    /// Drop declared inputs that no kept node consumes.
    pub prune_unused_inputs: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            float_precision: 6,
            use_var_name: false,
            input_aliases: Vec::new(),
            output_aliases: Vec::new(),
            byoc_entry: None,
            prune_unused_inputs: false,
        }
    }
}

impl BuildConfig {
    /// Parses an options string; blank input yields the defaults.
    pub fn from_json_str(options: &str) -> Result<Self> {
        if options.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(options)?)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_byoc_entry(mut self, entry: impl Into<String>) -> Self {
        self.byoc_entry = Some(entry.into());
        self
    }

    pub fn with_input_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Name of the function a build actually lowers.
    pub fn lowered_entry<'a>(&'a self, entry: &'a str) -> &'a str {
        match self.byoc_entry.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => entry,
        }
    }
}
