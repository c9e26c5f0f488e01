//! In-memory container runtime for tests
//!
//! Each opened channel is served by a small task that reads request lines
//! from a `tokio::io::duplex` pipe and answers with frames over an mpsc
//! channel, with a toy interpreter standing in for Python. Every channel gets
//! a fresh namespace, so a restart loses state exactly like the real server.
//!
//! [`ProcessRuntime`] instead runs the real execution server under a local
//! `python3`, for tests of the server script itself.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use super::error::SandboxError;
use super::frame::{Frame, FrameStream, StreamKind};
use super::protocol::{ExecRequest, ExecResponse, MAX_OUTPUT_BYTES, SERVER_FILE_NAME};
use super::runtime::{ContainerRuntime, ContainerSpec, ExecChannel, ExecOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerBehavior {
    Normal,
    /// Answer every request, including the startup check, with exit code 1
    FailStartupCheck,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    containers: HashSet<String>,
    volumes: HashSet<String>,
    archives: Vec<(String, String, Vec<u8>)>,
    last_spec: Option<ContainerSpec>,
    channel_opens: usize,
    fail_opens_after: Option<usize>,
    fail_ping: bool,
    fail_remove: bool,
    install_exit_code: i64,
}

pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    behavior: Arc<Mutex<ServerBehavior>>,
    requests: Arc<Mutex<Vec<String>>>,
    installed: Arc<Mutex<HashSet<String>>>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            behavior: Arc::new(Mutex::new(ServerBehavior::Normal)),
            requests: Arc::new(Mutex::new(Vec::new())),
            installed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(crate) fn set_behavior(&self, behavior: ServerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Let `n` channels open successfully, then fail every later attempt
    pub(crate) fn fail_channel_opens_after(&self, n: usize) {
        self.state.lock().unwrap().fail_opens_after = Some(n);
    }

    pub(crate) fn fail_ping(&self) {
        self.state.lock().unwrap().fail_ping = true;
    }

    pub(crate) fn fail_removals(&self) {
        self.state.lock().unwrap().fail_remove = true;
    }

    pub(crate) fn set_install_exit_code(&self, code: i64) {
        self.state.lock().unwrap().install_exit_code = code;
    }

    pub(crate) fn add_container(&self, name: &str) {
        self.state.lock().unwrap().containers.insert(name.to_string());
    }

    pub(crate) fn add_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(name.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn has_container(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains(name)
    }

    pub(crate) fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains(name)
    }

    pub(crate) fn channel_opens(&self) -> usize {
        self.state.lock().unwrap().channel_opens
    }

    pub(crate) fn last_spec(&self) -> Option<ContainerSpec> {
        self.state.lock().unwrap().last_spec.clone()
    }

    pub(crate) fn archives(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state.lock().unwrap().archives.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), SandboxError> {
        self.record("ping".to_string());
        if self.state.lock().unwrap().fail_ping {
            return Err(SandboxError::Transport {
                operation: "ping",
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.record(format!("ensure_image {}", image));
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.record(format!("create_volume {}", name));
        self.state.lock().unwrap().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<bool, SandboxError> {
        self.record(format!("remove_volume {}", name));
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(SandboxError::Api {
                operation: "remove volume",
                status: 500,
                message: "volume in use".to_string(),
            });
        }
        Ok(state.volumes.remove(name))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        self.record(format!("run_container {}", spec.name));
        let mut state = self.state.lock().unwrap();
        if state.containers.contains(&spec.name) {
            return Err(SandboxError::Api {
                operation: "create container",
                status: 409,
                message: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        state.containers.insert(spec.name.clone());
        state.last_spec = Some(spec.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn stop_container(&self, name: &str, _timeout_secs: u64) -> Result<(), SandboxError> {
        self.record(format!("stop_container {}", name));
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<bool, SandboxError> {
        self.record(format!("remove_container {}", name));
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(SandboxError::Transport {
                operation: "remove container",
                message: "daemon went away".to_string(),
            });
        }
        Ok(state.containers.remove(name))
    }

    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        self.record(format!("put_archive {} {}", container, path));
        self.state
            .lock()
            .unwrap()
            .archives
            .push((container.to_string(), path.to_string(), archive));
        Ok(())
    }

    async fn exec_once(&self, container: &str, cmd: &[String]) -> Result<ExecOutput, SandboxError> {
        self.record(format!("exec_once {} {}", container, cmd.join(" ")));
        let exit_code = self.state.lock().unwrap().install_exit_code;
        if exit_code == 0 && cmd.starts_with(&["uv".to_string(), "pip".to_string(), "install".to_string()]) {
            let mut installed = self.installed.lock().unwrap();
            for package in cmd.iter().skip(4) {
                installed.insert(package.clone());
            }
        }
        let output = if exit_code == 0 {
            format!("Installed {} packages\n", cmd.len().saturating_sub(4))
        } else {
            "error: No solution found when resolving dependencies\n".to_string()
        };
        Ok(ExecOutput {
            exit_code,
            output: output.into_bytes(),
        })
    }

    async fn open_channel(
        &self,
        container: &str,
        _cmd: &[String],
        _working_dir: &str,
    ) -> Result<ExecChannel, SandboxError> {
        self.record(format!("open_channel {}", container));
        let opens = {
            let mut state = self.state.lock().unwrap();
            if let Some(limit) = state.fail_opens_after
                && state.channel_opens >= limit
            {
                return Err(SandboxError::Api {
                    operation: "create exec",
                    status: 409,
                    message: format!("container {} is not running", container),
                });
            }
            state.channel_opens += 1;
            state.channel_opens
        };

        let (host, server) = tokio::io::duplex(256 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            server,
            tx,
            self.behavior.clone(),
            self.requests.clone(),
            self.installed.clone(),
        ));
        Ok(ExecChannel {
            exec_id: format!("exec-{}", opens),
            output: receiver_stream(rx),
            writer: Box::new(host),
        })
    }
}

type FrameSender = mpsc::UnboundedSender<Result<Frame, SandboxError>>;

fn receiver_stream(rx: mpsc::UnboundedReceiver<Result<Frame, SandboxError>>) -> FrameStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

enum Reply {
    Respond(ExecResponse),
    Frames(Vec<(StreamKind, Vec<u8>)>),
    StreamError,
    Crash,
    Hang,
}

async fn serve(
    stream: DuplexStream,
    tx: FrameSender,
    behavior: Arc<Mutex<ServerBehavior>>,
    requests: Arc<Mutex<Vec<String>>>,
    installed: Arc<Mutex<HashSet<String>>>,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut namespace: HashMap<String, String> = HashMap::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: ExecRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => {
                let reply = Reply::Respond(response(1, "", "Invalid JSON request\n"));
                if write_reply(&tx, reply).is_err() {
                    return;
                }
                continue;
            }
        };
        requests.lock().unwrap().push(request.code.clone());

        let current = *behavior.lock().unwrap();
        let reply = if current == ServerBehavior::FailStartupCheck {
            Reply::Respond(response(1, "", "boom\n"))
        } else {
            let installed = installed.lock().unwrap().clone();
            evaluate(&request, &mut namespace, &installed)
        };

        match reply {
            Reply::Crash => return,
            Reply::Hang => std::future::pending::<()>().await,
            reply => {
                if write_reply(&tx, reply).is_err() {
                    return;
                }
            }
        }
    }
}

fn write_reply(tx: &FrameSender, reply: Reply) -> Result<(), ()> {
    let frames = match reply {
        Reply::Respond(resp) => {
            let mut line = serde_json::to_vec(&resp).map_err(|_| ())?;
            line.push(b'\n');
            vec![(StreamKind::Stdout, line)]
        }
        Reply::Frames(frames) => frames,
        Reply::StreamError => {
            return tx
                .send(Err(SandboxError::Transport {
                    operation: "exec",
                    message: "connection reset by peer".to_string(),
                }))
                .map_err(|_| ());
        }
        Reply::Crash | Reply::Hang => Vec::new(),
    };
    for (kind, payload) in frames {
        tx.send(Ok(Frame { kind, payload })).map_err(|_| ())?;
    }
    Ok(())
}

fn response(exit_code: i64, stdout: &str, stderr: &str) -> ExecResponse {
    ExecResponse {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 1,
    }
}

const BUILTIN_MODULES: &[&str] = &["os", "sys", "time", "json", "math"];

/// Toy interpreter covering the statements the tests use
fn evaluate(
    request: &ExecRequest,
    namespace: &mut HashMap<String, String>,
    installed: &HashSet<String>,
) -> Reply {
    let code = request.code.as_str();
    if code.contains("os._exit") {
        return Reply::Crash;
    }
    if code == "__hang__" {
        return Reply::Hang;
    }
    if code == "__reset__" {
        return Reply::StreamError;
    }
    if code == "__garbage__" {
        return Reply::Frames(vec![(StreamKind::Stdout, b"Traceback: not json\n".to_vec())]);
    }
    if code == "__noisy__" {
        let mut line = serde_json::to_vec(&response(0, "quiet\n", "")).unwrap_or_default();
        line.push(b'\n');
        return Reply::Frames(vec![
            (StreamKind::Stderr, b"warning from the interpreter\n".to_vec()),
            (StreamKind::Stdout, line),
        ]);
    }
    if code == "__split__" {
        let mut line = serde_json::to_vec(&response(0, "split\n", "")).unwrap_or_default();
        line.push(b'\n');
        let tail = line.split_off(7);
        return Reply::Frames(vec![(StreamKind::Stdout, line), (StreamKind::Stdout, tail)]);
    }
    if code == "__big__" {
        return Reply::Respond(response(0, &"x".repeat(MAX_OUTPUT_BYTES + 4096), ""));
    }
    if code.contains("time.sleep") && request.timeout > 0 {
        let mut resp = response(
            124,
            "",
            &format!("Execution timed out after {} seconds\n", request.timeout),
        );
        resp.duration_ms = request.timeout * 1000;
        return Reply::Respond(resp);
    }

    let mut stdout = String::new();
    for stmt in code.split(['\n', ';']).map(str::trim).filter(|s| !s.is_empty()) {
        if stmt == "pass" {
            continue;
        }
        if let Some(module) = stmt
            .strip_prefix("import ")
            .or_else(|| stmt.strip_prefix("from "))
            .and_then(|s| s.split_whitespace().next())
        {
            if !BUILTIN_MODULES.contains(&module) && !installed.contains(module) {
                return Reply::Respond(response(
                    1,
                    &stdout,
                    &format!(
                        "Traceback (most recent call last):\nModuleNotFoundError: No module named '{}'\n",
                        module
                    ),
                ));
            }
            continue;
        }
        if let Some(arg) = stmt.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
            let arg = arg.trim();
            if let Some(literal) = strip_quotes(arg) {
                stdout.push_str(literal);
                stdout.push('\n');
                continue;
            }
            match namespace.get(arg) {
                Some(value) => {
                    stdout.push_str(value);
                    stdout.push('\n');
                    continue;
                }
                None => {
                    return Reply::Respond(response(
                        1,
                        &stdout,
                        &format!(
                            "Traceback (most recent call last):\nNameError: name '{}' is not defined\n",
                            arg
                        ),
                    ));
                }
            }
        }
        if let Some(arg) = stmt.strip_prefix("sys.exit(").and_then(|s| s.strip_suffix(')')) {
            let exit_code = arg.trim().parse().unwrap_or(1);
            return Reply::Respond(response(exit_code, &stdout, ""));
        }
        if let Some(rest) = stmt.strip_prefix("raise ") {
            return Reply::Respond(response(
                1,
                &stdout,
                &format!("Traceback (most recent call last):\n{}\n", rest),
            ));
        }
        if let Some((name, value)) = stmt.split_once('=') {
            let value = value.trim();
            let value = strip_quotes(value).unwrap_or(value);
            namespace.insert(name.trim().to_string(), value.to_string());
            continue;
        }
        return Reply::Respond(response(1, &stdout, "SyntaxError: invalid syntax\n"));
    }
    Reply::Respond(response(0, &stdout, ""))
}

fn strip_quotes(s: &str) -> Option<&str> {
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

/// Runs the real execution server as a local `python3` process. The
/// workspace is a host directory; archives are unpacked into it.
pub(crate) struct ProcessRuntime {
    root: PathBuf,
    opens: Mutex<usize>,
}

impl ProcessRuntime {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            opens: Mutex::new(0),
        }
    }

    pub(crate) fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn ping(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn create_volume(&self, _name: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn remove_volume(&self, _name: &str) -> Result<bool, SandboxError> {
        Ok(false)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        Ok(format!("local-{}", spec.name))
    }

    async fn stop_container(&self, _name: &str, _timeout_secs: u64) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn remove_container(&self, _name: &str) -> Result<bool, SandboxError> {
        Ok(false)
    }

    async fn put_archive(
        &self,
        _container: &str,
        _path: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        tar::Archive::new(archive.as_slice()).unpack(&self.root)?;
        Ok(())
    }

    async fn exec_once(&self, _container: &str, _cmd: &[String]) -> Result<ExecOutput, SandboxError> {
        Ok(ExecOutput {
            exit_code: 0,
            output: Vec::new(),
        })
    }

    async fn open_channel(
        &self,
        _container: &str,
        _cmd: &[String],
        _working_dir: &str,
    ) -> Result<ExecChannel, SandboxError> {
        let mut child = tokio::process::Command::new("python3")
            .arg("-u")
            .arg(self.root.join(SERVER_FILE_NAME))
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let missing = || SandboxError::Io(std::io::Error::other("child pipe missing"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let opens = {
            let mut opens = self.opens.lock().unwrap();
            *opens += 1;
            *opens
        };
        // The child is owned by the stdout stream and killed when it is dropped
        let output = stream::select(
            pipe_frames(stdout, StreamKind::Stdout, Some(child)),
            pipe_frames(stderr, StreamKind::Stderr, None),
        )
        .boxed();
        Ok(ExecChannel {
            exec_id: format!("process-{}", opens),
            output,
            writer: Box::new(stdin),
        })
    }
}

fn pipe_frames<R>(reader: R, kind: StreamKind, child: Option<tokio::process::Child>) -> FrameStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold((reader, child), move |(mut reader, child)| async move {
        let mut buf = vec![0_u8; 8192];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Frame { kind, payload: buf }), (reader, child)))
            }
            Err(e) => Some((Err(SandboxError::Io(e)), (reader, child))),
        }
    })
    .boxed()
}
