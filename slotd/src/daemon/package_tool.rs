// Package manager invocation for install/rebuild of the app slot

use std::path::Path;
use tokio::process::Command;

/// What the package tool is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Install,
    Rebuild,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Install => "install",
            Mode::Rebuild => "rebuild",
        }
    }

    /// Command name reported back to the client for this mode
    pub fn command_name(&self) -> &'static str {
        match self {
            Mode::Install => "install",
            Mode::Rebuild => "clean",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageTool {
    program: String,
}

impl PackageTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `<program> <install|rebuild> --color=always` with `cwd` as working dir
    pub fn command(&self, mode: Mode, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(mode.as_str()).arg("--color=always").current_dir(cwd);
        cmd
    }

    /// Framed completion banner, e.g. `NPM INSTALL COMPLETE! [ 0 ]`
    pub fn completion_banner(&self, mode: Mode, code: Option<i32>) -> String {
        let name = Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_uppercase())
            .unwrap_or_else(|| self.program.to_uppercase());
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let line = format!(
            "{} {} COMPLETE! [ {} ]",
            name,
            mode.as_str().to_uppercase(),
            code
        );
        let rule = "=".repeat(line.len());
        format!("\n{rule}\n{line}\n{rule}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_shape() {
        let tool = PackageTool::new("npm");
        let cmd = tool.command(Mode::Rebuild, Path::new("/srv/app"));
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "npm");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["rebuild", "--color=always"]);
        assert_eq!(std_cmd.get_current_dir(), Some(Path::new("/srv/app")));
    }

    #[test]
    fn test_completion_banner() {
        let tool = PackageTool::new("/usr/local/bin/npm");
        let banner = tool.completion_banner(Mode::Install, Some(0));
        assert!(banner.contains("NPM INSTALL COMPLETE! [ 0 ]"));

        let banner = tool.completion_banner(Mode::Rebuild, None);
        assert!(banner.contains("NPM REBUILD COMPLETE! [ signal ]"));
    }

    #[test]
    fn test_rebuild_reports_as_clean() {
        assert_eq!(Mode::Rebuild.command_name(), "clean");
        assert_eq!(Mode::Install.command_name(), "install");
    }
}
