//! Drivers for the external contract compilers.
//!
//! Compilation is delegated to `solc` (Ethereum) or `zksolc` (Layer2) run as
//! subprocesses. A binary missing from `PATH` surfaces as
//! [`CompileError::ToolchainMissing`], which callers treat as fatal.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use alloy_json_abi::JsonAbi;
use alloy_primitives::{hex, Bytes};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Language of a contract source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Solidity source.
    #[default]
    Solidity,
    /// Yul assembly.
    Yul,
}

impl SourceKind {
    /// Infers the kind from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yul") => Self::Yul,
            _ => Self::Solidity,
        }
    }
}

/// Which compiler family to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    /// The reference Solidity compiler.
    Solc,
    /// The zkSync era compiler.
    Zksolc,
}

impl Toolchain {
    /// Default executable name.
    pub fn program(self) -> &'static str {
        match self {
            Self::Solc => "solc",
            Self::Zksolc => "zksolc",
        }
    }
}

/// Compiler output for one contract.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledContract {
    /// Contract name.
    pub name: String,
    /// Creation bytecode.
    pub bytecode: Bytes,
    /// Contract ABI. Empty for Yul sources.
    pub abi: JsonAbi,
    /// Storage layout as emitted by the compiler.
    pub storage_layout: Option<Value>,
}

/// Errors from a compiler invocation.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler executable is not on `PATH`.
    #[error("compiler `{0}` not found on PATH")]
    ToolchainMissing(String),

    /// Source file could not be read.
    #[error("failed to read contract source {path}: {source}")]
    Source {
        /// Source path.
        path: PathBuf,
        /// IO error.
        source: io::Error,
    },

    /// The compiler process could not be driven.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Executable name.
        program: String,
        /// IO error.
        source: io::Error,
    },

    /// The compiler reported errors.
    #[error("{program} failed:\n{stderr}")]
    Failed {
        /// Executable name.
        program: String,
        /// Compiler diagnostics.
        stderr: String,
    },

    /// The requested contract is not in the compiler output.
    #[error("contract `{name}` not found in {path}")]
    MissingContract {
        /// Requested contract.
        name: String,
        /// Source path.
        path: PathBuf,
    },

    /// The compiler output could not be parsed.
    #[error("unexpected compiler output: {0}")]
    Output(String),
}

/// A compiler bound to a toolchain and executable.
#[derive(Debug, Clone)]
pub struct Compiler {
    toolchain: Toolchain,
    program: String,
}

impl Compiler {
    /// Uses the toolchain's default executable name.
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain, program: toolchain.program().to_string() }
    }

    /// Overrides the executable path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// The toolchain this compiler drives.
    pub fn toolchain(&self) -> Toolchain {
        self.toolchain
    }

    /// Compiles `name` from `path`.
    pub async fn compile(
        &self,
        path: &Path,
        name: &str,
        kind: SourceKind,
    ) -> Result<CompiledContract, CompileError> {
        debug!(program = %self.program, path = %path.display(), name, "compiling contract");
        match self.toolchain {
            Toolchain::Solc => self.compile_standard_json(path, name, kind).await,
            Toolchain::Zksolc => match kind {
                SourceKind::Solidity => self.compile_combined_json(path, name).await,
                SourceKind::Yul => self.compile_zk_yul(path, name).await,
            },
        }
    }

    async fn compile_standard_json(
        &self,
        path: &Path,
        name: &str,
        kind: SourceKind,
    ) -> Result<CompiledContract, CompileError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CompileError::Source { path: path.to_path_buf(), source })?;
        let language = match kind {
            SourceKind::Solidity => "Solidity",
            SourceKind::Yul => "Yul",
        };
        let input = json!({
            "language": language,
            "sources": { "Contract": { "content": source } },
            "settings": {
                "outputSelection": {
                    "*": { "*": ["abi", "evm.bytecode.object", "storageLayout"] }
                }
            }
        });

        let stdout = self.run(&["--standard-json"], Some(input.to_string().as_bytes())).await?;
        parse_standard_json(&self.program, &stdout, path, name, kind)
    }

    async fn compile_combined_json(
        &self,
        path: &Path,
        name: &str,
    ) -> Result<CompiledContract, CompileError> {
        let path_arg = path.to_string_lossy();
        let stdout =
            self.run(&["--combined-json", "abi,bin,storage-layout", &path_arg], None).await?;
        parse_combined_json(&stdout, path, name)
    }

    async fn compile_zk_yul(&self, path: &Path, name: &str) -> Result<CompiledContract, CompileError> {
        let path_arg = path.to_string_lossy();
        let stdout = self.run(&["--yul", "--bin", &path_arg], None).await?;
        parse_yul_binary(&stdout, name)
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, CompileError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        // The pipe is dropped at the end of this block, closing the child's stdin.
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(|source| self.spawn_error(source))?;
        }

        let output = child.wait_with_output().await.map_err(|source| self.spawn_error(source))?;
        if !output.status.success() {
            return Err(CompileError::Failed {
                program: self.program.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }

    fn spawn_error(&self, source: io::Error) -> CompileError {
        if source.kind() == io::ErrorKind::NotFound {
            CompileError::ToolchainMissing(self.program.clone())
        } else {
            CompileError::Spawn { program: self.program.clone(), source }
        }
    }
}

/// Picks `name` out of `solc --standard-json` output.
fn parse_standard_json(
    program: &str,
    stdout: &[u8],
    path: &Path,
    name: &str,
    kind: SourceKind,
) -> Result<CompiledContract, CompileError> {
    let output: Value =
        serde_json::from_slice(stdout).map_err(|err| CompileError::Output(err.to_string()))?;

    let errors: Vec<&str> = output["errors"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|diag| diag["severity"] == "error")
        .filter_map(|diag| diag["formattedMessage"].as_str().or_else(|| diag["message"].as_str()))
        .collect();
    if !errors.is_empty() {
        return Err(CompileError::Failed { program: program.to_string(), stderr: errors.join("\n") });
    }

    let contracts = output["contracts"]["Contract"]
        .as_object()
        .ok_or_else(|| CompileError::Output("missing contracts section".into()))?;
    // Yul objects are keyed by object name, so a lone contract is accepted as is.
    let contract = contracts
        .get(name)
        .or_else(|| if contracts.len() == 1 { contracts.values().next() } else { None })
        .ok_or_else(|| CompileError::MissingContract { name: name.into(), path: path.into() })?;

    let bytecode = parse_bytecode(contract["evm"]["bytecode"]["object"].as_str())?;
    let (abi, storage_layout) = match kind {
        SourceKind::Solidity => (parse_abi(&contract["abi"])?, contract.get("storageLayout").cloned()),
        SourceKind::Yul => (JsonAbi::new(), None),
    };
    Ok(CompiledContract { name: name.to_string(), bytecode, abi, storage_layout })
}

/// Picks the `<file>:<name>` entry out of `zksolc --combined-json` output.
fn parse_combined_json(stdout: &[u8], path: &Path, name: &str) -> Result<CompiledContract, CompileError> {
    let output: Value =
        serde_json::from_slice(stdout).map_err(|err| CompileError::Output(err.to_string()))?;

    let suffix = format!(":{name}");
    let contract = output["contracts"]
        .as_object()
        .and_then(|contracts| {
            contracts.iter().find(|(key, _)| key.ends_with(&suffix)).map(|(_, value)| value)
        })
        .ok_or_else(|| CompileError::MissingContract { name: name.into(), path: path.into() })?;

    let bytecode = parse_bytecode(contract["bin"].as_str())?;
    // Older releases emit the ABI as an embedded JSON string.
    let abi = match &contract["abi"] {
        Value::String(raw) => {
            serde_json::from_str(raw).map_err(|err| CompileError::Output(err.to_string()))?
        }
        other => parse_abi(other)?,
    };
    let storage_layout = contract.get("storage-layout").filter(|v| !v.is_null()).cloned();
    Ok(CompiledContract { name: name.to_string(), bytecode, abi, storage_layout })
}

/// Reads the binary out of `zksolc --yul --bin` text output.
fn parse_yul_binary(stdout: &[u8], name: &str) -> Result<CompiledContract, CompileError> {
    let text = String::from_utf8_lossy(stdout);
    // The binary is the last whitespace separated token.
    let bytecode = parse_bytecode(text.split_whitespace().last())?;
    Ok(CompiledContract { name: name.to_string(), bytecode, abi: JsonAbi::new(), storage_layout: None })
}

fn parse_bytecode(raw: Option<&str>) -> Result<Bytes, CompileError> {
    let raw = raw.ok_or_else(|| CompileError::Output("missing bytecode".into()))?;
    let bytes = hex::decode(raw.trim()).map_err(|err| CompileError::Output(err.to_string()))?;
    if bytes.is_empty() {
        return Err(CompileError::Output("empty bytecode".into()));
    }
    Ok(bytes.into())
}

fn parse_abi(value: &Value) -> Result<JsonAbi, CompileError> {
    serde_json::from_value(value.clone()).map_err(|err| CompileError::Output(err.to_string()))
}
