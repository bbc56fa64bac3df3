//! # Grammar Repository
//!
//! ## Responsibility
//! Filesystem-backed CRUD for named grammar definitions
//! (`<data>/grammars/<dir>/<name>.gbnf`) and resolution of grammar
//! references to their bodies for constrained generation.
//!
//! ## Guarantees
//! - Files on disk are the source of truth; no in-memory cache
//! - Names are validated against path-traversal and reserved characters
//! - The `default` directory cannot be deleted
//!
//! ## NOT Responsible For
//! - Concurrency control: grammars are small, rarely edited, and
//!   administrator-owned; last-writer-wins across concurrent updates
//! - Grammar semantics beyond a minimal `::=` syntax check

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Grammar repository errors.
#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("grammar name contains invalid characters")]
    InvalidName,

    #[error("directory name contains invalid characters")]
    InvalidDirectory,

    #[error("invalid grammar syntax: must contain '::=' rules")]
    InvalidSyntax,

    #[error("invalid grammar reference format: {0}")]
    InvalidReference(String),

    #[error("grammar {dir}/{name} already exists")]
    AlreadyExists { dir: String, name: String },

    #[error("grammar {dir}/{name} not found")]
    NotFound { dir: String, name: String },

    #[error("directory {0} not found")]
    DirectoryNotFound(String),

    #[error("directory {0} already exists")]
    DirectoryExists(String),

    #[error("cannot delete default directory")]
    ProtectedDirectory,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A grammar definition with file metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grammar {
    pub name: String,
    pub directory: String,
    pub description: String,
    pub body: String,
    pub size: u64,
    /// Unix seconds; approximated by mtime for pre-existing files.
    pub created: u64,
    pub modified: u64,
}

/// Characters never allowed in grammar names.
const RESERVED_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
/// Characters never allowed in directory names (a single `/` level is the
/// reference separator, so it is rejected here too; directories are flat).
const RESERVED_DIR_CHARS: &[char] = &['\\', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a grammar name.
pub fn validate_name(name: &str) -> Result<(), GrammarError> {
    if name.is_empty() || name.contains(RESERVED_NAME_CHARS) {
        return Err(GrammarError::InvalidName);
    }
    Ok(())
}

/// Validate a directory name. Empty means "default" and is accepted.
pub fn validate_directory(dir: &str) -> Result<(), GrammarError> {
    if dir.is_empty() {
        return Ok(());
    }
    if dir.contains(RESERVED_DIR_CHARS) || Path::new(dir).is_absolute() || dir.contains('/') {
        return Err(GrammarError::InvalidDirectory);
    }
    Ok(())
}

fn mtime_unix(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Filesystem store rooted at `<data>/grammars`.
pub struct GrammarStore {
    root: PathBuf,
}

impl GrammarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn grammar_path(&self, dir: &str, name: &str) -> PathBuf {
        self.root.join(dir).join(format!("{name}.gbnf"))
    }

    fn read_grammar(&self, dir: &str, name: &str, path: &Path) -> Result<Grammar, GrammarError> {
        let meta = std::fs::metadata(path).map_err(|_| GrammarError::NotFound {
            dir: dir.to_string(),
            name: name.to_string(),
        })?;
        let body = std::fs::read_to_string(path)?;
        Ok(Grammar {
            name: name.to_string(),
            directory: dir.to_string(),
            description: String::new(),
            size: meta.len(),
            created: mtime_unix(&meta),
            modified: mtime_unix(&meta),
            body,
        })
    }

    pub fn create(
        &self,
        dir: &str,
        name: &str,
        body: &str,
        description: &str,
    ) -> Result<Grammar, GrammarError> {
        std::fs::create_dir_all(self.root.join(dir))?;
        let path = self.grammar_path(dir, name);
        if path.exists() {
            return Err(GrammarError::AlreadyExists {
                dir: dir.to_string(),
                name: name.to_string(),
            });
        }
        std::fs::write(&path, body)?;

        let mut grammar = self.read_grammar(dir, name, &path)?;
        grammar.description = description.to_string();
        Ok(grammar)
    }

    pub fn get(&self, dir: &str, name: &str) -> Result<Grammar, GrammarError> {
        let path = self.grammar_path(dir, name);
        if !path.exists() {
            return Err(GrammarError::NotFound {
                dir: dir.to_string(),
                name: name.to_string(),
            });
        }
        self.read_grammar(dir, name, &path)
    }

    pub fn update(
        &self,
        dir: &str,
        name: &str,
        body: &str,
        description: &str,
    ) -> Result<Grammar, GrammarError> {
        let path = self.grammar_path(dir, name);
        if !path.exists() {
            return Err(GrammarError::NotFound {
                dir: dir.to_string(),
                name: name.to_string(),
            });
        }
        std::fs::write(&path, body)?;
        let mut grammar = self.read_grammar(dir, name, &path)?;
        grammar.description = description.to_string();
        Ok(grammar)
    }

    pub fn delete(&self, dir: &str, name: &str) -> Result<(), GrammarError> {
        let path = self.grammar_path(dir, name);
        if !path.exists() {
            return Err(GrammarError::NotFound {
                dir: dir.to_string(),
                name: name.to_string(),
            });
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// List grammars in a directory; a missing directory is an empty list.
    pub fn list(&self, dir: &str) -> Result<Vec<Grammar>, GrammarError> {
        let dir_path = self.root.join(dir);
        if !dir_path.exists() {
            return Ok(Vec::new());
        }
        let mut grammars = Vec::new();
        for entry in std::fs::read_dir(&dir_path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = file_name.strip_suffix(".gbnf") else {
                continue;
            };
            if let Ok(grammar) = self.read_grammar(dir, name, &entry.path()) {
                grammars.push(grammar);
            }
        }
        grammars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(grammars)
    }

    /// List directories under the grammar root; a missing root is empty.
    pub fn list_directories(&self) -> Result<Vec<String>, GrammarError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn create_directory(&self, name: &str) -> Result<(), GrammarError> {
        let path = self.root.join(name);
        if path.exists() {
            return Err(GrammarError::DirectoryExists(name.to_string()));
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    pub fn delete_directory(&self, name: &str) -> Result<(), GrammarError> {
        let path = self.root.join(name);
        if !path.exists() {
            return Err(GrammarError::DirectoryNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

/// Validation and resolution on top of [`GrammarStore`].
pub struct GrammarService {
    store: GrammarStore,
}

impl GrammarService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: GrammarStore::new(root),
        }
    }

    fn directory_or_default(dir: &str) -> &str {
        if dir.is_empty() {
            "default"
        } else {
            dir
        }
    }

    pub fn create(
        &self,
        dir: &str,
        name: &str,
        body: &str,
        description: &str,
    ) -> Result<Grammar, GrammarError> {
        validate_name(name)?;
        validate_directory(dir)?;
        if !body.contains("::=") {
            return Err(GrammarError::InvalidSyntax);
        }
        let dir = Self::directory_or_default(dir);
        info!(name = name, directory = dir, size = body.len(), "creating grammar");
        self.store.create(dir, name, body, description)
    }

    pub fn get(&self, dir: &str, name: &str) -> Result<Grammar, GrammarError> {
        self.store.get(Self::directory_or_default(dir), name)
    }

    pub fn update(
        &self,
        dir: &str,
        name: &str,
        body: &str,
        description: &str,
    ) -> Result<Grammar, GrammarError> {
        if !body.contains("::=") {
            return Err(GrammarError::InvalidSyntax);
        }
        let dir = Self::directory_or_default(dir);
        info!(name = name, directory = dir, size = body.len(), "updating grammar");
        self.store.update(dir, name, body, description)
    }

    pub fn delete(&self, dir: &str, name: &str) -> Result<(), GrammarError> {
        let dir = Self::directory_or_default(dir);
        info!(name = name, directory = dir, "deleting grammar");
        self.store.delete(dir, name)
    }

    pub fn list(&self, dir: &str) -> Result<Vec<Grammar>, GrammarError> {
        self.store.list(Self::directory_or_default(dir))
    }

    pub fn list_directories(&self) -> Result<Vec<String>, GrammarError> {
        self.store.list_directories()
    }

    pub fn create_directory(&self, name: &str) -> Result<(), GrammarError> {
        validate_directory(name)?;
        if name.is_empty() {
            return Err(GrammarError::InvalidDirectory);
        }
        info!(name = name, "creating grammar directory");
        self.store.create_directory(name)
    }

    pub fn delete_directory(&self, name: &str) -> Result<(), GrammarError> {
        if name == "default" {
            return Err(GrammarError::ProtectedDirectory);
        }
        info!(name = name, "deleting grammar directory");
        self.store.delete_directory(name)
    }

    /// Resolve a grammar reference to its body.
    ///
    /// Inline bodies (anything containing `::=`) win over named references.
    /// Named references are `dir/name` or bare `name` under `default`.
    pub fn resolve(&self, reference: &str) -> Result<String, GrammarError> {
        if reference.is_empty() {
            return Ok(String::new());
        }
        if reference.contains("::=") {
            debug!(length = reference.len(), "using inline grammar");
            return Ok(reference.to_string());
        }

        let parts: Vec<&str> = reference.split('/').collect();
        let (dir, name) = match parts.as_slice() {
            [name] => ("default", *name),
            [dir, name] => (*dir, *name),
            _ => return Err(GrammarError::InvalidReference(reference.to_string())),
        };

        let grammar = self.store.get(dir, name)?;
        debug!(reference = reference, dir = dir, name = name, "resolved grammar reference");
        Ok(grammar.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_GRAMMAR: &str = r#"root ::= object
object ::= "{" "}""#;

    fn service() -> (tempfile::TempDir, GrammarService) {
        let dir = tempfile::tempdir().unwrap();
        let svc = GrammarService::new(dir.path().join("grammars"));
        (dir, svc)
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let (_dir, svc) = service();
        let created = svc.create("default", "json", JSON_GRAMMAR, "JSON objects").unwrap();
        assert_eq!(created.name, "json");
        assert_eq!(created.directory, "default");
        assert_eq!(created.description, "JSON objects");
        assert!(created.size > 0);

        let fetched = svc.get("default", "json").unwrap();
        assert_eq!(fetched.body, JSON_GRAMMAR);
    }

    #[test]
    fn test_create_duplicate_conflicts() {
        let (_dir, svc) = service();
        svc.create("default", "json", JSON_GRAMMAR, "").unwrap();
        let result = svc.create("default", "json", JSON_GRAMMAR, "");
        assert!(matches!(result, Err(GrammarError::AlreadyExists { .. })));
    }

    #[test]
    fn test_create_rejects_reserved_characters() {
        let (_dir, svc) = service();
        for bad in ["a/b", "a\\b", "a:b", "a*b", "a?b", "a\"b", "a<b", "a>b", "a|b", ""] {
            let result = svc.create("default", bad, JSON_GRAMMAR, "");
            assert!(
                matches!(result, Err(GrammarError::InvalidName)),
                "name {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_create_rejects_missing_rules() {
        let (_dir, svc) = service();
        let result = svc.create("default", "empty", "no rules here", "");
        assert!(matches!(result, Err(GrammarError::InvalidSyntax)));
    }

    #[test]
    fn test_empty_directory_maps_to_default() {
        let (_dir, svc) = service();
        svc.create("", "json", JSON_GRAMMAR, "").unwrap();
        assert!(svc.get("default", "json").is_ok());
    }

    #[test]
    fn test_update_replaces_body() {
        let (_dir, svc) = service();
        svc.create("default", "json", JSON_GRAMMAR, "").unwrap();
        let updated_body = "root ::= \"x\"";
        let updated = svc.update("default", "json", updated_body, "v2").unwrap();
        assert_eq!(updated.body, updated_body);
        assert_eq!(svc.get("default", "json").unwrap().body, updated_body);
    }

    #[test]
    fn test_update_missing_grammar_not_found() {
        let (_dir, svc) = service();
        let result = svc.update("default", "ghost", JSON_GRAMMAR, "");
        assert!(matches!(result, Err(GrammarError::NotFound { .. })));
    }

    #[test]
    fn test_delete_then_get_not_found() {
        let (_dir, svc) = service();
        svc.create("default", "json", JSON_GRAMMAR, "").unwrap();
        svc.delete("default", "json").unwrap();
        assert!(matches!(
            svc.get("default", "json"),
            Err(GrammarError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_returns_sorted_grammars() {
        let (_dir, svc) = service();
        svc.create("default", "b", JSON_GRAMMAR, "").unwrap();
        svc.create("default", "a", JSON_GRAMMAR, "").unwrap();
        let list = svc.list("default").unwrap();
        let names: Vec<_> = list.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let (_dir, svc) = service();
        assert!(svc.list("nowhere").unwrap().is_empty());
    }

    #[test]
    fn test_directory_lifecycle() {
        let (_dir, svc) = service();
        svc.create_directory("team").unwrap();
        assert!(svc.list_directories().unwrap().contains(&"team".to_string()));
        assert!(matches!(
            svc.create_directory("team"),
            Err(GrammarError::DirectoryExists(_))
        ));
        svc.delete_directory("team").unwrap();
        assert!(!svc.list_directories().unwrap().contains(&"team".to_string()));
    }

    #[test]
    fn test_default_directory_cannot_be_deleted() {
        let (_dir, svc) = service();
        svc.create("default", "json", JSON_GRAMMAR, "").unwrap();
        assert!(matches!(
            svc.delete_directory("default"),
            Err(GrammarError::ProtectedDirectory)
        ));
    }

    #[test]
    fn test_directory_validation_rejects_absolute_paths() {
        assert!(validate_directory("/etc").is_err());
        assert!(validate_directory("a:b").is_err());
        assert!(validate_directory("team").is_ok());
        assert!(validate_directory("").is_ok());
    }

    #[test]
    fn test_resolve_inline_grammar_wins() {
        let (_dir, svc) = service();
        let inline = "root ::= \"inline\"";
        assert_eq!(svc.resolve(inline).unwrap(), inline);
    }

    #[test]
    fn test_resolve_bare_name_uses_default_directory() {
        let (_dir, svc) = service();
        svc.create("default", "json", JSON_GRAMMAR, "").unwrap();
        assert_eq!(svc.resolve("json").unwrap(), JSON_GRAMMAR);
    }

    #[test]
    fn test_resolve_dir_slash_name() {
        let (_dir, svc) = service();
        svc.create_directory("team").unwrap();
        svc.create("team", "json", JSON_GRAMMAR, "").unwrap();
        assert_eq!(svc.resolve("team/json").unwrap(), JSON_GRAMMAR);
    }

    #[test]
    fn test_resolve_too_many_segments_is_invalid() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.resolve("a/b/c"),
            Err(GrammarError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_resolve_missing_named_grammar_fails() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.resolve("ghost"),
            Err(GrammarError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_empty_reference_is_empty() {
        let (_dir, svc) = service();
        assert_eq!(svc.resolve("").unwrap(), "");
    }
}
