//! Path helpers
//!
//! Paths handed to the mount runtime are relative to the mount root and use
//! `/` as separator. Leading, trailing and repeated separators are ignored.

use crate::error::{Error, Result};

/// Check that `name` is usable as a single directory entry name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("invalid entry name {:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArgument(format!("invalid entry name {:?}", name)));
    }
    Ok(())
}

/// Split a mount-relative path into validated components
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    let mut components = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        validate_name(component)?;
        components.push(component);
    }
    Ok(components)
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_path("/a//b/").unwrap(), vec!["a", "b"]);
        assert!(split_path("").unwrap().is_empty());
        assert!(split_path("a/../b").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("foo.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }
}
