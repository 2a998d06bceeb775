use std::{
    ffi::{OsStr, OsString},
    fmt::Write as _,
};

use eyre::WrapErr as _;
use tokio::process::Command;

/// A program plus leading arguments, e.g. `docker-compose -f stack.yml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPrefix {
    program: String,
    args: Vec<String>,
}

impl CommandPrefix {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandPrefix {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits `line` on whitespace; no shell quoting is interpreted.
    pub fn parse(line: &str) -> eyre::Result<Self> {
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| eyre::eyre!("empty command line"))?;
        Ok(CommandPrefix::new(program, words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(crate) async fn run<I, S>(&self, args: I) -> eyre::Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        run(&self.program, self.full_args(args)).await
    }

    pub(crate) async fn run_checked<I, S>(&self, args: I) -> eyre::Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        run_checked(&self.program, self.full_args(args)).await
    }

    fn full_args<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .iter()
            .map(OsString::from)
            .chain(args.into_iter().map(|arg| arg.as_ref().to_os_string()))
            .collect()
    }
}

/// Exit code and combined output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    /// `-1` when the process was killed by a signal.
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs `program` with `args` to completion, capturing stdout followed by stderr.
///
/// A non-zero exit is not an error here; only failing to spawn is.
pub(crate) async fn run<I, S>(program: &str, args: I) -> eyre::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    log::debug!("exec: {}", describe(&cmd));

    let out = cmd
        .output()
        .await
        .wrap_err_with(|| format!("failed to run {program}"))?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    Ok(CommandOutput {
        code: out.status.code().unwrap_or(-1),
        output,
    })
}

/// Like [`run`], but a non-zero exit becomes an error carrying the output.
pub(crate) async fn run_checked<I, S>(program: &str, args: I) -> eyre::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = run(program, args).await?;

    if !out.success() {
        eyre::bail!(
            "{program} exited with code {}: {}",
            out.code,
            out.output.trim_end()
        );
    }

    Ok(out)
}

fn describe(cmd: &Command) -> String {
    let inner = cmd.as_std();
    let mut line = inner.get_program().to_string_lossy().into_owned();
    for arg in inner.get_args() {
        let _ = write!(line, " {}", arg.to_string_lossy());
    }
    line
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let out = run("sh", ["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap();

        assert_eq!(out.code, 3);
        assert_eq!(out.output, "out\nerr\n");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn checked_run_fails_on_nonzero() {
        let err = run_checked("sh", ["-c", "echo nope; exit 1"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        run_checked("true", std::iter::empty::<&str>()).await.unwrap();
    }

    #[tokio::test]
    async fn prefix_args_come_first() {
        let prefix = CommandPrefix::parse("sh  -c").unwrap();
        assert_eq!(prefix.program(), "sh");

        let out = prefix.run(["echo \"$0 $1\"", "first", "second"]).await.unwrap();
        assert_eq!(out.output, "first second\n");

        assert!(CommandPrefix::parse("   ").is_err());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        assert!(run("definitely-not-a-real-program-xyz", ["x"]).await.is_err());
    }
}
