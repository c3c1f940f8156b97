use std::process::{Command, Stdio};

use crate::error::{GateError, Result};

pub fn tool_version(tool: &str) -> Option<String> {
    let output = Command::new(tool)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string())
}

pub fn require_tool(tool: &str) -> Result<String> {
    tool_version(tool).ok_or_else(|| {
        GateError::Setup(format!("required tool not found or not runnable: {}", tool))
    })
}

#[derive(Debug, Clone)]
pub struct ToolchainVersions {
    pub rustc: String,
    pub cargo: String,
}

impl ToolchainVersions {
    pub fn detect() -> Self {
        let unavailable = || "unavailable".to_string();
        Self {
            rustc: tool_version("rustc").unwrap_or_else(unavailable),
            cargo: tool_version("cargo").unwrap_or_else(unavailable),
        }
    }
}
