//! Control surface: a Unix datagram socket accepting one administrative
//! command per packet, each translated into exactly one engine message.
//! Malformed commands are logged and never kill the socket.

use crate::instance::{CtrlCommand, EngineMsg};
use anyhow::{Context, Result};
use log::{info, warn};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Parse one command packet. Returns an error string for the log on
/// malformed input.
pub fn parse_command(line: &str) -> Result<CtrlCommand, String> {
    let line = line.trim();
    let (name, arg) = match line.split_once('=') {
        Some((n, a)) => (n, Some(a)),
        None => (line, None),
    };

    match (name, arg) {
        ("exit", None) => Ok(CtrlCommand::Exit),
        ("logrotate", None) => Ok(CtrlCommand::LogRotate),
        ("stepclocks", None) => Ok(CtrlCommand::StepClocks),
        ("dumptables", None) => Ok(CtrlCommand::DumpTables),
        ("selectinstance", Some(name)) if !name.is_empty() => {
            Ok(CtrlCommand::SelectInstance(name.to_string()))
        }
        ("testmode", Some(spec)) if !spec.is_empty() => {
            let mut parts = spec.split(',');
            let mode = parts.next().unwrap_or_default().to_string();
            Ok(CtrlCommand::TestMode {
                mode,
                args: parts.map(str::to_string).collect(),
            })
        }
        ("pid_adjust", spec) => parse_pid_adjust(spec.unwrap_or_default()),
        _ => Err(format!("unrecognised command '{}'", line)),
    }
}

/// `pid_adjust=[KP[,KI[,KD[,local|ptp|pps|reset]*]]]`
fn parse_pid_adjust(spec: &str) -> Result<CtrlCommand, String> {
    let mut kp = None;
    let mut ki = None;
    let mut kd = None;
    let mut targets = Vec::new();

    for (i, part) in spec.split(',').enumerate() {
        if part.is_empty() {
            continue;
        }
        let gain = match i {
            0 => Some(&mut kp),
            1 => Some(&mut ki),
            2 => Some(&mut kd),
            _ => None,
        };
        match gain {
            Some(slot) => match part.parse::<f64>() {
                Ok(v) => *slot = Some(v),
                Err(_) => return Err(format!("pid_adjust: bad gain '{}'", part)),
            },
            None => match part {
                "local" | "ptp" | "pps" | "reset" => targets.push(part.to_string()),
                other => return Err(format!("pid_adjust: bad target '{}'", other)),
            },
        }
    }

    Ok(CtrlCommand::PidAdjust {
        kp,
        ki,
        kd,
        targets,
    })
}

pub struct ControlServer {
    sock: UnixDatagram,
    path: PathBuf,
    engine_tx: SyncSender<EngineMsg>,
    running: Arc<AtomicBool>,
}

impl ControlServer {
    pub fn bind(
        path: &Path,
        engine_tx: SyncSender<EngineMsg>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let sock = UnixDatagram::bind(path)
            .with_context(|| format!("binding control socket {}", path.display()))?;
        sock.set_read_timeout(Some(Duration::from_millis(500)))?;
        info!("control: listening on {}", path.display());
        Ok(ControlServer {
            sock,
            path: path.to_path_buf(),
            engine_tx,
            running,
        })
    }

    fn serve(self) {
        let mut buf = [0u8; 512];
        while self.running.load(Ordering::SeqCst) {
            let len = match self.sock.recv(&mut buf) {
                Ok(len) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    warn!("control: recv failed: {}", e);
                    continue;
                }
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            match parse_command(&text) {
                Ok(cmd) => {
                    info!("control: {}", text.trim());
                    match self.engine_tx.try_send(EngineMsg::Command(cmd)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("control: engine inbox full, dropping command")
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Err(e) => warn!("control: {}", e),
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("control".to_string())
            .spawn(move || self.serve())
            .expect("spawning control task")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("exit"), Ok(CtrlCommand::Exit));
        assert_eq!(parse_command("logrotate"), Ok(CtrlCommand::LogRotate));
        assert_eq!(parse_command("stepclocks"), Ok(CtrlCommand::StepClocks));
        assert_eq!(parse_command("dumptables"), Ok(CtrlCommand::DumpTables));
        assert_eq!(parse_command("  exit\n"), Ok(CtrlCommand::Exit));
    }

    #[test]
    fn test_parse_selectinstance() {
        assert_eq!(
            parse_command("selectinstance=chrony1"),
            Ok(CtrlCommand::SelectInstance("chrony1".to_string()))
        );
        assert!(parse_command("selectinstance=").is_err());
    }

    #[test]
    fn test_parse_testmode() {
        assert_eq!(
            parse_command("testmode=step_clock,500000"),
            Ok(CtrlCommand::TestMode {
                mode: "step_clock".to_string(),
                args: vec!["500000".to_string()],
            })
        );
    }

    #[test]
    fn test_parse_pid_adjust_full() {
        assert_eq!(
            parse_command("pid_adjust=0.5,0.05,0.0,ptp,reset"),
            Ok(CtrlCommand::PidAdjust {
                kp: Some(0.5),
                ki: Some(0.05),
                kd: Some(0.0),
                targets: vec!["ptp".to_string(), "reset".to_string()],
            })
        );
    }

    #[test]
    fn test_parse_pid_adjust_partial() {
        assert_eq!(
            parse_command("pid_adjust=0.5"),
            Ok(CtrlCommand::PidAdjust {
                kp: Some(0.5),
                ki: None,
                kd: None,
                targets: vec![],
            })
        );
        assert_eq!(
            parse_command("pid_adjust="),
            Ok(CtrlCommand::PidAdjust {
                kp: None,
                ki: None,
                kd: None,
                targets: vec![],
            })
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_command("stepclock").is_err());
        assert!(parse_command("pid_adjust=abc").is_err());
        assert!(parse_command("pid_adjust=1,2,3,bogus").is_err());
        assert!(parse_command("").is_err());
        assert!(parse_command("exit=now").is_err());
    }

    #[test]
    fn test_socket_round_trip() {
        use std::sync::mpsc::sync_channel;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrl.sock");
        let (tx, rx) = sync_channel(8);
        let running = Arc::new(AtomicBool::new(true));

        let server = ControlServer::bind(&path, tx, running.clone()).unwrap();
        let join = server.spawn();

        let client = UnixDatagram::unbound().unwrap();
        client.send_to(b"stepclocks", &path).unwrap();
        client.send_to(b"not-a-command", &path).unwrap();
        client.send_to(b"exit", &path).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            first,
            EngineMsg::Command(CtrlCommand::StepClocks)
        ));
        // The malformed packet is swallowed; the next delivery is exit.
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(second, EngineMsg::Command(CtrlCommand::Exit)));

        running.store(false, Ordering::SeqCst);
        join.join().unwrap();
    }
}
