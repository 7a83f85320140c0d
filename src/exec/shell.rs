// src/exec/shell.rs

//! Table of supported command types.
//!
//! Each command-type tag resolves to a [`ShellSpec`] describing the script
//! suffix and how the interpreter is invoked. Lookups are case-insensitive.

use std::path::Path;

/// How a staged script is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellSpec {
    /// Canonical name, used in logs.
    pub name: &'static str,
    /// Script file suffix, including the dot.
    pub suffix: &'static str,
    /// Interpreter executable.
    pub program: &'static str,
    /// Arguments placed before the script path.
    pub args: &'static [&'static str],
    /// Script content is written in the legacy console code page and the
    /// process output may come back in it.
    pub legacy_console: bool,
}

impl ShellSpec {
    const fn new(name: &'static str, suffix: &'static str, program: &'static str) -> Self {
        Self {
            name,
            suffix,
            program,
            args: &[],
            legacy_console: false,
        }
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    const fn with_args(mut self, args: &'static [&'static str]) -> Self {
        self.args = args;
        self
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    const fn legacy(mut self) -> Self {
        self.legacy_console = true;
        self
    }

    /// Full argument list for running `script`.
    pub fn command_args(&self, script: &Path) -> Vec<std::ffi::OsString> {
        self.args
            .iter()
            .map(std::ffi::OsString::from)
            .chain(std::iter::once(script.as_os_str().to_os_string()))
            .collect()
    }
}

const PYTHON2: ShellSpec = ShellSpec::new("python2", ".py", "python2");
const PYTHON3: ShellSpec = ShellSpec::new("python3", ".py", "python3");

#[cfg(not(windows))]
const SHELLS: &[(&[&str], ShellSpec)] = &[
    (&["ash"], ShellSpec::new("ash", ".ash", "ash")),
    (&["bash"], ShellSpec::new("bash", ".bash", "bash")),
    (&["csh"], ShellSpec::new("csh", ".csh", "csh")),
    (&["dash"], ShellSpec::new("dash", ".dash", "dash")),
    (&["ksh"], ShellSpec::new("ksh", ".ksh", "ksh")),
    (&["sh", "shell"], ShellSpec::new("sh", ".sh", "sh")),
    (&["tcsh"], ShellSpec::new("tcsh", ".tcsh", "tcsh")),
    (&["zsh"], ShellSpec::new("zsh", ".zsh", "zsh")),
    (&["python", "python2", "py", "py2"], PYTHON2),
    (&["python3", "py3"], PYTHON3),
];

#[cfg(windows)]
const SHELLS: &[(&[&str], ShellSpec)] = &[
    (
        &["cmd", "bat"],
        ShellSpec::new("cmd", ".bat", "cmd").with_args(&["/C"]).legacy(),
    ),
    (
        &["powershell", "ps", "ps1"],
        ShellSpec::new("powershell", ".ps1", "powershell")
            .with_args(&[
                "-NoLogo",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ])
            .legacy(),
    ),
    (&["python", "python2", "py", "py2"], PYTHON2),
    (&["python3", "py3"], PYTHON3),
];

/// Resolve a command-type tag to its shell descriptor.
pub fn lookup(tag: &str) -> Option<&'static ShellSpec> {
    let tag = tag.trim().to_ascii_lowercase();
    SHELLS
        .iter()
        .find(|(aliases, _)| aliases.contains(&tag.as_str()))
        .map(|(_, spec)| spec)
}

/// All accepted command-type tags on this platform.
pub fn supported_tags() -> impl Iterator<Item = &'static str> {
    SHELLS.iter().flat_map(|(aliases, _)| aliases.iter().copied())
}
