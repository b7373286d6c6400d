//! Tool environments and response files.
//!
//! A tool's environment is split in two: `stamped` variables participate in
//! operation hashing because they can change what the tool produces, while
//! `unstamped` variables are passed at exec time but ignored for hashing
//! (scratch locations like TMPDIR do not affect outputs).

use std::collections::BTreeMap;
use std::path::Path;

/// Variables ignored for hashing unless the caller says otherwise.
pub const DEFAULT_UNSTAMPED_VARS: &[&str] = &["TMPDIR", "TEMP", "TMP"];

/// A tool environment split into hashed and unhashed variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolEnv {
    stamped: BTreeMap<String, String>,
    unstamped: BTreeMap<String, String>,
}

impl ToolEnv {
    /// Split `env` according to `unstamped_vars`.
    #[must_use]
    pub fn new(env: BTreeMap<String, String>, unstamped_vars: &[&str]) -> Self {
        let mut stamped = BTreeMap::new();
        let mut unstamped = BTreeMap::new();
        for (k, v) in env {
            if unstamped_vars.iter().any(|u| *u == k) {
                unstamped.insert(k, v);
            } else {
                stamped.insert(k, v);
            }
        }
        Self { stamped, unstamped }
    }

    /// An environment where every variable is stamped.
    #[must_use]
    pub fn from_stamped(stamped: BTreeMap<String, String>) -> Self {
        Self {
            stamped,
            unstamped: BTreeMap::new(),
        }
    }

    /// Variables that participate in operation hashing.
    #[must_use]
    pub fn stamped(&self) -> &BTreeMap<String, String> {
        &self.stamped
    }

    /// Variables passed at exec time but not hashed.
    #[must_use]
    pub fn unstamped(&self) -> &BTreeMap<String, String> {
        &self.unstamped
    }

    /// The full environment handed to the child process.
    #[must_use]
    pub fn exec_env(&self) -> BTreeMap<String, String> {
        let mut env = self.stamped.clone();
        for (k, v) in &self.unstamped {
            env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        env
    }
}

/// A scheme for moving a long command line into a file.
///
/// `to_file` serializes the arguments into the file's contents and `cli`
/// produces the replacement command line referencing that file.
#[derive(Clone, Copy)]
pub struct ResponseFile {
    /// Serialize arguments into file contents.
    pub to_file: fn(&[String]) -> Vec<u8>,
    /// Rewrite the command line to reference the response file.
    pub cli: fn(&Path) -> Vec<String>,
}

fn args0_to_file(args: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if i != 0 {
            out.push(0);
        }
        out.extend_from_slice(arg.as_bytes());
    }
    out
}

fn args0_cli(file: &Path) -> Vec<String> {
    vec!["-args0".to_string(), file.display().to_string()]
}

/// The default response file scheme: arguments separated by NUL bytes,
/// invoked as `tool -args0 <file>`.
pub const ARGS0: ResponseFile = ResponseFile {
    to_file: args0_to_file,
    cli: args0_cli,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn splits_by_unstamped_vars() {
        let e = ToolEnv::new(
            env(&[("CC", "gcc"), ("TMPDIR", "/tmp"), ("LANG", "C")]),
            DEFAULT_UNSTAMPED_VARS,
        );
        assert_eq!(e.stamped().len(), 2);
        assert_eq!(e.unstamped().get("TMPDIR").unwrap(), "/tmp");
        assert_eq!(e.exec_env().len(), 3);
    }

    #[test]
    fn path_is_stamped_by_default() {
        let e = ToolEnv::new(env(&[("PATH", "/usr/bin")]), DEFAULT_UNSTAMPED_VARS);
        assert!(e.stamped().contains_key("PATH"));
    }

    #[test]
    fn args0_scheme() {
        let args = vec!["-c".to_string(), "-o".to_string(), "a.o".to_string()];
        let contents = (ARGS0.to_file)(&args);
        assert_eq!(contents, b"-c\0-o\0a.o");
        let cli = (ARGS0.cli)(&PathBuf::from("/tmp/resp"));
        assert_eq!(cli, vec!["-args0".to_string(), "/tmp/resp".to_string()]);
    }
}
