//! Interactive loop for `replbox repl`

use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use replbox_core::sandbox::{DockerSandbox, SandboxError};

const HELP: &str = "\
Commands:
  :install <pkg> [pkg...]  install packages with uv
  :info                    show sandbox details
  :help                    show this help
  :quit                    stop the sandbox and exit
Lines ending in ':' start a block; finish it with an empty line.";

/// What a line of input asks for
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Help,
    Info,
    Install(Vec<String>),
    Code(String),
    /// Part of an unfinished block
    Pending,
}

/// Accumulates lines into cells
#[derive(Default)]
struct CellBuffer {
    lines: Vec<String>,
}

impl CellBuffer {
    fn in_block(&self) -> bool {
        !self.lines.is_empty()
    }

    fn push(&mut self, line: &str) -> Input {
        if self.in_block() {
            if line.trim().is_empty() {
                return Input::Code(std::mem::take(&mut self.lines).join("\n"));
            }
            self.lines.push(line.to_string());
            return Input::Pending;
        }

        let trimmed = line.trim();
        match trimmed {
            ":quit" | ":q" | ":exit" => return Input::Quit,
            ":help" | ":h" => return Input::Help,
            ":info" => return Input::Info,
            _ => {}
        }
        if let Some(rest) = trimmed.strip_prefix(":install") {
            return Input::Install(rest.split_whitespace().map(str::to_string).collect());
        }
        if trimmed.ends_with(':') {
            self.lines.push(line.to_string());
            return Input::Pending;
        }
        if trimmed.is_empty() {
            return Input::Pending;
        }
        Input::Code(line.to_string())
    }
}

fn prompt(in_block: bool) {
    eprint!("{}", if in_block { "... " } else { ">>> " });
    let _ = std::io::stderr().flush();
}

/// Read cells from stdin until EOF, `:quit` or Ctrl-C
pub async fn run(sandbox: &mut DockerSandbox) -> Result<()> {
    eprintln!(
        "replbox session {} (container {}). Type :help for commands.",
        sandbox.session_id(),
        sandbox.container_name()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = CellBuffer::default();

    loop {
        prompt(buffer.in_block());
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            eprintln!();
            break;
        };

        match buffer.push(&line) {
            Input::Quit => break,
            Input::Pending => {}
            Input::Help => eprintln!("{}", HELP),
            Input::Info => println!("{}", serde_json::to_string_pretty(&sandbox.info())?),
            Input::Install(packages) => match sandbox.run_install(&packages).await {
                Ok(result) => {
                    print!("{}", result.output);
                    if result.exit_code != 0 {
                        eprintln!("install exited with {}", result.exit_code);
                    }
                }
                Err(e) => eprintln!("error: {}", e),
            },
            Input::Code(code) => {
                let outcome = tokio::select! {
                    r = sandbox.run_code(&code, None) => r,
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupted");
                        break;
                    }
                };
                match outcome {
                    Ok(result) => {
                        print!("{}", result.stdout);
                        eprint!("{}", result.stderr);
                    }
                    Err(SandboxError::Timeout { result, seconds }) => {
                        print!("{}", result.stdout);
                        eprintln!("timed out after {}s", seconds);
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => eprintln!("error: {}", e),
                }
                let _ = std::io::stdout().flush();
            }
        }
    }
    Ok(())
}
