//! PTY wrapper for `mb run`: spawn the child on a pseudo-terminal, forward
//! bytes transparently, and capture sanitized events on the side. Terminal
//! resizes are propagated to the child PTY while it runs. Capture failures
//! never disturb the child.

use std::io::IsTerminal;
use std::io::Read;
use std::io::Write;
use std::time::Duration;
use std::time::Instant;

use memory_bank_core::MemoryBankError;
use memory_bank_core::models::EventStream;
use memory_bank_core::models::SessionEvent;
use memory_bank_core::models::SessionSource;
use memory_bank_core::redact::redact;
use memory_bank_core::sanitizer::AnsiStripper;
use memory_bank_core::storage::CreateSession;
use memory_bank_core::storage::Store;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tracing::debug;

const READ_BUF_SIZE: usize = 16 * 1024;
/// How often the parent checks for child exit and terminal resizes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn terminal_size() -> PtySize {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct Capture {
    store: Store,
    session_id: String,
    started: Instant,
    redaction: bool,
}

impl Capture {
    fn record(&self, stream: EventStream, stripper: &mut AnsiStripper, data: &[u8]) {
        let text = stripper.process(data);
        self.record_text(stream, &text);
    }

    fn record_text(&self, stream: EventStream, text: &str) {
        if text.is_empty() {
            return;
        }
        let content = if self.redaction {
            redact(text)
        } else {
            text.to_string()
        };
        let event = SessionEvent {
            ts: self.started.elapsed().as_secs_f64(),
            stream,
            text: content,
        };
        if let Err(err) = self.store.append_event(&self.session_id, &event) {
            debug!("dropping captured event: {err}");
        }
    }
}

/// Run `command` inside a PTY with transparent capture. Returns the child's
/// exit code.
pub fn run_session(command: &[String], store: &Store) -> memory_bank_core::Result<i32> {
    let Some(program) = command.first() else {
        return Err(MemoryBankError::SessionNotFound(
            "no command specified".to_string(),
        ));
    };
    let redaction = store.read_config()?.redaction.enabled;

    let meta = store.create_session(CreateSession::new(
        command.to_vec(),
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        SessionSource::Pty,
    ))?;
    eprintln!("[mb] Session {} started", meta.id);

    let started = Instant::now();
    let capture = Capture {
        store: store.clone(),
        session_id: meta.id.clone(),
        started,
        redaction,
    };
    capture.record_text(EventStream::System, "session_start");

    let pty_system = native_pty_system();
    let mut last_size = terminal_size();
    let pair = pty_system
        .openpty(last_size)
        .map_err(|err| MemoryBankError::Io(std::io::Error::other(err.to_string())))?;

    let mut builder = CommandBuilder::new(program);
    builder.args(command.iter().skip(1));
    if let Ok(cwd) = std::env::current_dir() {
        builder.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| MemoryBankError::Io(std::io::Error::other(err.to_string())))?;
    drop(pair.slave);

    let is_tty = std::io::stdin().is_terminal();
    if is_tty {
        let _ = crossterm::terminal::enable_raw_mode();
    }

    // Child stdin: forward raw bytes from our stdin, capturing sanitized
    // input on the side. The thread parks on stdin reads and dies with the
    // process.
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| MemoryBankError::Io(std::io::Error::other(err.to_string())))?;
    let input_capture = Capture {
        store: store.clone(),
        session_id: meta.id.clone(),
        started,
        redaction,
    };
    std::thread::spawn(move || {
        let mut stripper = AnsiStripper::new();
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    input_capture.record(EventStream::In, &mut stripper, &buf[..n]);
                }
            }
        }
    });

    // Child output: forward to our stdout first, then capture. Runs on its
    // own thread so the parent is free to reap the child and track resizes.
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| MemoryBankError::Io(std::io::Error::other(err.to_string())))?;
    let output_capture = Capture {
        store: store.clone(),
        session_id: meta.id.clone(),
        started,
        redaction,
    };
    let output_pump = std::thread::spawn(move || {
        let mut stripper = AnsiStripper::new();
        let mut stdout = std::io::stdout().lock();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = stdout.write_all(&buf[..n]);
                    let _ = stdout.flush();
                    output_capture.record(EventStream::Out, &mut stripper, &buf[..n]);
                }
            }
        }
        let remaining = stripper.flush();
        output_capture.record_text(EventStream::Out, &remaining);
    });

    // Reap the child while mirroring terminal size changes onto the PTY so
    // full-screen programs keep rendering correctly after a resize.
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.exit_code() as i32,
            Ok(None) => {}
            Err(_) => break 1,
        }
        if is_tty {
            let size = terminal_size();
            if size.rows != last_size.rows || size.cols != last_size.cols {
                let _ = pair.master.resize(size);
                last_size = size;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    // The reader hits EOF once the child is gone; drain it before closing.
    let _ = output_pump.join();
    drop(pair.master);

    if is_tty {
        let _ = crossterm::terminal::disable_raw_mode();
    }

    capture.record_text(EventStream::System, "session_end");
    store.finalize_session(&meta.id, Some(exit_code), None)?;

    eprintln!("[mb] Session {} ended (exit code: {exit_code})", meta.id);
    Ok(exit_code)
}
