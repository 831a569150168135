//! Conditions worth reporting that don't stop a model from running.

use std::{
    collections::HashSet,
    fmt,
    sync::{Mutex, OnceLock},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Diagnostic {
    /// A component asked for distributed variables on a communicator that can't partition data.
    DistributedFallback { component: String },
    /// A component set an option through its deprecated spelling.
    DeprecatedOption { component: String, option: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::DistributedFallback { component } => write!(
                f,
                "The 'distributed' option is set to True for Component {component}, but there is \
                 no distributed vector implementation available. The default non-distributed \
                 vectors will be used."
            ),
            Diagnostic::DeprecatedOption { component, option } => write!(
                f,
                "The '{option}' property of Component {component} provides backwards \
                 compatibility with earlier releases; use the '{option}' option instead."
            ),
        }
    }
}

/// What a successful setup has to say about the model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub diagnostics: Vec<Diagnostic>,
}

/// Log `diagnostic` as a warning the first time it is seen in this process.
pub(crate) fn warn_once(diagnostic: &Diagnostic) {
    static SEEN: OnceLock<Mutex<HashSet<Diagnostic>>> = OnceLock::new();

    let first = SEEN
        .get_or_init(Default::default)
        .lock()
        .map(|mut seen| seen.insert(diagnostic.clone()))
        .unwrap_or(true);
    if first {
        log::warn!("{diagnostic}");
    }
}
