use coda_cli::{Action, Launcher, Outcome};
use coda_core::frame::TCP_MESSAGE_TERMINATOR;
use coda_core::protocol::types::FileStat;
use coda_core::{CodaDevice, Framing, MemoryStream, MemoryStreamHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn tcp(message: &[u8]) -> Vec<u8> {
    let mut framed = message.to_vec();
    framed.extend_from_slice(&TCP_MESSAGE_TERMINATOR);
    framed
}

/// Agent double answering commands written to a memory stream.
///
/// `respond` gets the `\0`-split fields of each command (`C`, token, service,
/// command, params...) and returns the messages to send back.
struct FakeAgent {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Vec<String>>,
}

impl FakeAgent {
    fn spawn<F>(handle: MemoryStreamHandle, mut respond: F) -> Self
    where
        F: FnMut(&[String]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut pending = Vec::new();
            let mut seen = Vec::new();
            while !flag.load(Ordering::SeqCst) {
                pending.extend(handle.take_written());
                while let Some(pos) = pending.windows(2).position(|w| w == TCP_MESSAGE_TERMINATOR) {
                    let message: Vec<u8> = pending.drain(..pos + 2).take(pos).collect();
                    let fields: Vec<String> = message
                        .split(|&b| b == 0)
                        .map(|f| String::from_utf8_lossy(f).into_owned())
                        .collect();
                    if fields.len() >= 4 {
                        seen.push(format!("{} {}", fields[2], fields[3]));
                    }
                    for reply in respond(&fields) {
                        handle.inject(&tcp(&reply));
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }
            seen
        });
        Self { stop, thread }
    }

    fn finish(self) -> Vec<String> {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.join().expect("agent thread panicked")
    }
}

fn reply(fields: &[String], values: &str) -> Vec<Vec<u8>> {
    let token = &fields[1];
    if token == "-1" {
        return Vec::new();
    }
    vec![format!("R\0{token}\0{values}").into_bytes()]
}

fn tcp_device() -> (coda_core::SharedDevice, MemoryStreamHandle) {
    let (stream, handle) = MemoryStream::new();
    (CodaDevice::with_stream(Framing::Tcp, Box::new(stream)).into_shared(), handle)
}

#[test]
fn test_put_writes_in_chunks() {
    let source = std::env::temp_dir().join(format!("coda-put-{}.bin", std::process::id()));
    std::fs::write(&source, b"0123456789").unwrap();

    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| match fields[3].as_str() {
        "open" => reply(fields, "\"h7\"\0"),
        _ => reply(fields, ""),
    });

    let action = Action::Put { local: source.clone(), remote: "C:\\data\\digits.bin".into(), chunk_size: 4 };
    let mut launcher = Launcher::new(action, device).unwrap();
    let outcome = launcher.run(Some(Duration::from_secs(5))).unwrap();
    std::fs::remove_file(&source).unwrap();

    assert_eq!(outcome, Outcome::Written { bytes: 10 });
    assert_eq!(
        agent.finish(),
        vec![
            "FileSystem open",
            "FileSystem write",
            "FileSystem write",
            "FileSystem write",
            "FileSystem close",
        ]
    );
}

#[test]
fn test_stat_opens_reads_and_closes() {
    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| match fields[3].as_str() {
        "open" => reply(fields, "\"h1\"\0"),
        "fstat" => reply(fields, "{\"Size\":2048,\"ATime\":100,\"MTime\":200}\0"),
        _ => reply(fields, ""),
    });

    let mut launcher = Launcher::new(Action::Stat { remote: "C:\\x.txt".into() }, device).unwrap();
    let outcome = launcher.run(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(
        outcome,
        Outcome::Stat(FileStat { size: 2048, access_time: 100, modification_time: 200 })
    );
    assert_eq!(agent.finish(), vec!["FileSystem open", "FileSystem fstat", "FileSystem close"]);
}

#[test]
fn test_install_error_fails_action() {
    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| {
        reply(fields, "{\"Time\":1,\"Code\":17,\"Format\":\"Not found\"}\0")
    });

    let action = Action::Install { file: "C:\\app.sis".into(), silent: true, drive: 'E' };
    let mut launcher = Launcher::new(action, device).unwrap();
    let err = launcher.run(Some(Duration::from_secs(5))).unwrap_err();

    assert!(err.to_string().contains("Error code 17: Not found"), "{err}");
    assert_eq!(agent.finish(), vec!["SymbianInstall installWithOptions"]);
}

#[test]
fn test_malformed_reply_fails_action() {
    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| reply(fields, "{broken\0"));

    let action = Action::Install { file: "C:\\app.sis".into(), silent: false, drive: 'C' };
    let mut launcher = Launcher::new(action, device).unwrap();
    let started = std::time::Instant::now();
    let err = launcher.run(Some(Duration::from_secs(20))).unwrap_err();

    assert!(err.to_string().contains("command failed"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(agent.finish(), vec!["SymbianInstall install"]);
}

#[test]
fn test_debug_launch_resumes_until_exit() {
    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| match fields[3].as_str() {
        "start" => {
            let mut out = reply(fields, "{\"ID\":\"p5\",\"Name\":\"app.exe\"}\0");
            out.push(b"E\0Logging\0write\0\"p5\"\0\"hello\\n\"\0".to_vec());
            out.push(
                b"E\0RunControl\0contextSuspended\0\"p5.t1\"\x004096\0\"Shared Library\"\0{\"Name\":\"lib.dll\",\"RequireResume\":true}\0"
                    .to_vec(),
            );
            out
        }
        "resume" => {
            let mut out = reply(fields, "");
            out.push(b"E\0Processes\0exited\0\"p5\"\x003\0".to_vec());
            out
        }
        _ => reply(fields, ""),
    });

    let console = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&console);
    let action = Action::Launch { binary: "c:\\sys\\bin\\app.exe".into(), uid: 0xE000_0001, arguments: Vec::new(), debug: true };
    let mut launcher = Launcher::new(action, device)
        .unwrap()
        .with_output(move |text| sink.lock().unwrap().push_str(text));
    let outcome = launcher.run(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(outcome, Outcome::Exited { process_id: "p5".into(), exit_code: 3 });
    assert_eq!(*console.lock().unwrap(), "hello\n");
    assert_eq!(
        agent.finish(),
        vec!["Settings set", "Logging addListener", "Processes start", "RunControl resume"]
    );
}

#[test]
fn test_plain_launch_reports_process() {
    let (device, handle) = tcp_device();
    let agent = FakeAgent::spawn(handle, |fields| reply(fields, "{\"ID\":\"p9\"}\0"));

    let action = Action::Launch { binary: "c:\\sys\\bin\\app.exe".into(), uid: 1, arguments: vec!["-v".into()], debug: false };
    let mut launcher = Launcher::new(action, device).unwrap();
    let outcome = launcher.run(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(outcome, Outcome::Launched { process_id: "p9".into() });
    assert_eq!(agent.finish(), vec!["Processes start"]);
}

#[tokio::test]
async fn test_tcp_ping_completes_on_hello() {
    let (device, handle) = tcp_device();
    handle.inject(&tcp(b"E\0Locator\0Hello\0[\"Locator\",\"FileSystem\"]\0"));

    let outcome = tokio::task::spawn_blocking(move || {
        let mut launcher = Launcher::new(Action::Ping, device).unwrap();
        launcher.run(Some(Duration::from_secs(5)))
    });
    let outcome = tokio::time::timeout(Duration::from_secs(10), outcome)
        .await
        .expect("Timeout waiting for ping")
        .expect("launcher task panicked")
        .unwrap();

    assert_eq!(outcome, Outcome::Hello(vec!["Locator".into(), "FileSystem".into()]));
    // The engine answers the greeting itself.
    assert!(handle.written().starts_with(&tcp(b"E\0Locator\0Hello\0[\"Locator\"]\0")));
}
