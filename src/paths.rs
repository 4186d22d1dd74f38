use std::path::{Path, PathBuf};

const RITUAL_DIR: &str = ".ritual";

/// Resolve the `.ritual/` data directory for a base path.
///
/// Walks upward from `start` looking for an existing `.ritual/` directory.
/// When none exists, returns `start/.ritual` so a fresh setup lands next to
/// where the user invoked the tool.
pub fn resolve_ritual_dir(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(RITUAL_DIR);
        if candidate.is_dir() {
            return candidate;
        }
        if !dir.pop() {
            return start.join(RITUAL_DIR);
        }
    }
}

/// Path of the durable state database inside the ritual directory.
pub fn state_db_path(ritual_dir: &Path) -> PathBuf {
    ritual_dir.join("state.db")
}

/// Path of the JSONL transition log inside the ritual directory.
pub fn transition_log_path(ritual_dir: &Path) -> PathBuf {
    ritual_dir.join("transitions.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_existing_dir_in_start() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".ritual")).unwrap();

        let result = resolve_ritual_dir(tmp.path());
        assert_eq!(result, tmp.path().join(".ritual"));
    }

    #[test]
    fn walks_up_to_parent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".ritual")).unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let result = resolve_ritual_dir(&nested);
        assert_eq!(result, tmp.path().join(".ritual"));
    }

    #[test]
    fn defaults_to_start_when_none_exists() {
        let tmp = tempfile::tempdir().unwrap();

        let result = resolve_ritual_dir(tmp.path());
        assert_eq!(result, tmp.path().join(".ritual"));
    }

    #[test]
    fn derived_paths_land_inside_ritual_dir() {
        let dir = PathBuf::from("/home/u/.ritual");
        assert_eq!(state_db_path(&dir), dir.join("state.db"));
        assert_eq!(transition_log_path(&dir), dir.join("transitions.jsonl"));
    }
}
