//! Extraction of `<kind>.csv` dumps
//!
//! The database client is external. For every configured command the runner
//! writes the templated statement to `<kind>.sql`, runs `exec_template`
//! through `sh -c`, optionally pipes the raw output through `post_command`
//! and a `match_lines` filter, and leaves the result in `<kind>.csv`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::config::{SqlCommandConfig, SqlConfig};

const SQL_TMP_SUFFIX: &str = ".sqltmp";
const POST_TMP_SUFFIX: &str = ".posttmp";
const MATCH_TMP_SUFFIX: &str = ".matchtmp";

pub type Result<T> = std::result::Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No configured sql command matches '{0}'")]
    UnknownCommand(String),

    #[error("Command for '{kind}' exited with {}: {command}{}", exit_code(.code), stderr_suffix(.stderr))]
    CommandFailed {
        kind: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command for '{kind}' succeeded but did not create {path}")]
    MissingOutput { kind: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" ({})", stderr)
    }
}

/// Produces the dumps of one snapshot
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Write every configured `<kind>.csv` into `output_dir` and return their paths
    async fn extract(&self, output_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Runs the `[sql]` commands from the configuration
#[derive(Debug, Clone)]
pub struct SqlExtractor {
    config: SqlConfig,
}

impl SqlExtractor {
    pub fn new(config: SqlConfig) -> Self {
        Self { config }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.config.commands.iter().map(|c| c.name.as_str())
    }

    /// Run the command named `kind`, or every command for `*`
    pub async fn run_matching(&self, kind: &str, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let selected: Vec<&SqlCommandConfig> = self
            .config
            .commands
            .iter()
            .filter(|c| kind == "*" || c.name == kind)
            .collect();
        if selected.is_empty() {
            return Err(ExtractError::UnknownCommand(kind.to_string()));
        }

        tokio::fs::create_dir_all(output_dir).await?;
        let mut outputs = Vec::with_capacity(selected.len());
        for command in selected {
            outputs.push(self.run_command(command, output_dir).await?);
        }
        Ok(outputs)
    }

    /// Produce `<output_dir>/<name>.csv` for one command
    pub async fn run_command(
        &self,
        command: &SqlCommandConfig,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let kind = command.name.as_str();
        let statement_path = output_dir.join(format!("{}.sql", kind));
        let output_path = output_dir.join(format!("{}.csv", kind));
        let temp = TempFiles::new(&output_path);

        let result = self
            .run_stages(kind, command, &statement_path, &output_path, &temp)
            .await;
        temp.remove().await?;
        result?;

        info!(kind, output = %output_path.display(), "Extraction finished");
        Ok(output_path)
    }

    async fn run_stages(
        &self,
        kind: &str,
        command: &SqlCommandConfig,
        statement_path: &Path,
        output_path: &Path,
        temp: &TempFiles,
    ) -> Result<()> {
        let statement = render_statement(&self.config.command_template, &command.command);
        tokio::fs::write(statement_path, statement).await?;

        let exec = self
            .config
            .exec_template
            .replace("{statement}", &statement_path.to_string_lossy())
            .replace("{output}", &temp.sql.to_string_lossy());
        info!(kind, command = %exec, "Executing extraction");
        run_shell(kind, &exec).await?;
        require_file(kind, &temp.sql).await?;

        match &self.config.post_command {
            Some(post) => {
                let post = post
                    .replace("{input}", &temp.sql.to_string_lossy())
                    .replace("{output}", &temp.post.to_string_lossy());
                info!(kind, command = %post, "Executing post command");
                run_shell(kind, &post).await?;
                require_file(kind, &temp.post).await?;
            },
            None => tokio::fs::rename(&temp.sql, &temp.post).await?,
        }

        match &self.config.match_lines {
            Some(pattern) => {
                let kept = filter_lines(&temp.post, &temp.matched, pattern).await?;
                info!(kind, pattern = %pattern, kept, "Filtered matching lines");
            },
            None => tokio::fs::rename(&temp.post, &temp.matched).await?,
        }

        tokio::fs::rename(&temp.matched, output_path).await?;
        Ok(())
    }
}

#[async_trait]
impl Extractor for SqlExtractor {
    async fn extract(&self, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut outputs = Vec::with_capacity(self.config.commands.len());
        for command in &self.config.commands {
            outputs.push(self.run_command(command, output_dir).await?);
        }
        Ok(outputs)
    }
}

/// Multi-line commands are joined with spaces before templating
fn render_statement(template: &str, command: &str) -> String {
    let command = command.lines().collect::<Vec<_>>().join(" ");
    template.replace("{command}", &command)
}

async fn run_shell(kind: &str, command: &str) -> Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.stdout.is_empty() {
        debug!(kind, stdout = %String::from_utf8_lossy(&output.stdout).trim(), "Command output");
    }
    if !output.status.success() {
        return Err(ExtractError::CommandFailed {
            kind: kind.to_string(),
            command: command.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn require_file(kind: &str, path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        Ok(())
    } else {
        Err(ExtractError::MissingOutput {
            kind: kind.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// Copy the header plus every line containing `pattern`; returns the data lines kept
async fn filter_lines(input: &Path, output: &Path, pattern: &str) -> Result<usize> {
    let mut lines = BufReader::new(tokio::fs::File::open(input).await?).lines();
    let mut writer = BufWriter::new(tokio::fs::File::create(output).await?);

    if let Some(header) = lines.next_line().await? {
        writer.write_all(header.trim_end().as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    let mut kept = 0;
    while let Some(line) = lines.next_line().await? {
        if line.contains(pattern) {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            kept += 1;
        }
    }
    writer.flush().await?;
    Ok(kept)
}

/// Intermediate files next to the final dump
struct TempFiles {
    sql: PathBuf,
    post: PathBuf,
    matched: PathBuf,
}

impl TempFiles {
    fn new(output: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = output.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            sql: with_suffix(SQL_TMP_SUFFIX),
            post: with_suffix(POST_TMP_SUFFIX),
            matched: with_suffix(MATCH_TMP_SUFFIX),
        }
    }

    async fn remove(&self) -> Result<()> {
        for path in [&self.sql, &self.post, &self.matched] {
            match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {},
            }
        }
        Ok(())
    }
}
