use std::path::Path;

/// Names of the process definition files a repository must contain.
pub const DEFINITION_FILE_NAMES: [&str; 2] = ["concord.yml", ".concord.yml"];

/// Checks that fetched content looks like a process definition.
pub trait DefinitionValidator: Send + Sync {
    fn has_definition_marker(&self, path: &Path) -> bool;
}

/// Accepts directories containing `concord.yml` or `.concord.yml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcordFileValidator;

impl DefinitionValidator for ConcordFileValidator {
    fn has_definition_marker(&self, path: &Path) -> bool {
        DEFINITION_FILE_NAMES
            .iter()
            .any(|name| path.join(name).is_file())
    }
}
