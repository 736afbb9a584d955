use serde::{Deserialize, Serialize};

/// Descriptor-layer limits, fixed at mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountOptions {
    /// Size of the file-descriptor table.
    pub max_files: usize,
    /// Size of the directory-handle table.
    pub max_dirs: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            max_files: 8,
            max_dirs: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = MountOptions::default();
        assert_eq!(opts.max_files, 8);
        assert_eq!(opts.max_dirs, 2);
    }
}
