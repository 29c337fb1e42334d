//! Command dispatcher.
//!
//! Acts on one framed command: resolves it against the catalog, applies
//! the artificial-delay and reply-shaping rules, and routes the handful
//! of commands that are not pure table lookups — filesystem commands to
//! the VFS, `time` to the machine clock, `upload`/`download` to the
//! transfer engine.
//!
//! # Reply shaping
//!
//! A reply is composed in a fixed order: the body (with a trailing LF
//! when non-empty), then `ok\n` when the descriptor asks for it, then
//! the `0x04` end-of-transmission sentinel when the descriptor is
//! EOT-terminated. Error replies are single lines of the form
//! `error:<message>` and never carry `ok`, but keep the sentinel so
//! clients that frame on it stay in sync.
//!
//! Every reply is preceded by a delay of at least
//! [`gantry_core::catalog::DEFAULT_TIME_MS`] milliseconds — the real
//! machine is never faster than that.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::catalog::{Catalog, CommandDescriptor};
use gantry_core::clock::MachineClock;
use gantry_core::vfs::VirtualFs;
use tracing::{debug, info, warn};

/// Per-connection dispatch state.
#[derive(Debug)]
pub struct ConnectionState {
    /// Remote address, used only for logging.
    pub peer: SocketAddr,
    /// Current working directory; every connection starts at the root.
    pub cwd: String,
}

impl ConnectionState {
    #[must_use]
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            cwd: "/".to_string(),
        }
    }
}

/// A fully shaped reply, ready for the wire after its delay.
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    /// Exact bytes to write.
    pub bytes: Vec<u8>,
    /// Minimum time between RECV and SEND.
    pub delay: Duration,
    /// Body text for the SEND trace (without shaping bytes).
    pub log_body: String,
    /// Trace at DEBUG instead of INFO.
    pub debug_only: bool,
}

impl Reply {
    /// Shapes a successful reply per the descriptor's flags.
    #[must_use]
    pub fn shaped(body: &str, descriptor: &CommandDescriptor) -> Self {
        let mut bytes = Vec::with_capacity(body.len() + 8);
        if !body.is_empty() {
            bytes.extend_from_slice(body.as_bytes());
            bytes.push(b'\n');
        }
        if descriptor.sends_ok {
            bytes.extend_from_slice(b"ok\n");
        }
        if descriptor.eot_terminated {
            bytes.push(0x04);
        }
        Self {
            bytes,
            delay: delay_for(descriptor),
            log_body: body.to_string(),
            debug_only: descriptor.debug_output_only,
        }
    }

    /// Shapes an `error:<message>` reply. The EOT sentinel still applies
    /// when the descriptor carries it; `ok` never does.
    #[must_use]
    pub fn error(message: &str, descriptor: Option<&CommandDescriptor>) -> Self {
        let body = format!("error:{message}");
        let mut bytes = body.clone().into_bytes();
        bytes.push(b'\n');
        if descriptor.is_some_and(|d| d.eot_terminated) {
            bytes.push(0x04);
        }
        Self {
            bytes,
            delay: descriptor.map_or(floor_delay(), delay_for),
            log_body: body,
            debug_only: descriptor.is_some_and(|d| d.debug_output_only),
        }
    }
}

/// Which way an XMODEM transfer moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Client sends, server receives into the VFS.
    Upload,
    /// Server sends out of the VFS.
    Download,
}

/// A transfer the connection loop must execute before replying.
#[derive(Debug)]
pub struct TransferPlan {
    pub direction: TransferDirection,
    /// CWD snapshot for path resolution.
    pub cwd: String,
    /// Path argument as given on the command line.
    pub path: String,
    /// Descriptor of `upload`/`download`, for shaping the follow-up reply.
    pub descriptor: CommandDescriptor,
}

/// What the dispatcher decided about one command.
#[derive(Debug)]
pub enum Outcome {
    /// Sleep, write, trace.
    Reply(Reply),
    /// Hand the connection to the transfer engine, then reply.
    Transfer(TransferPlan),
    /// Blank input; nothing goes on the wire.
    Silent,
}

/// Stateless command dispatcher shared by all connections.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    vfs: Arc<VirtualFs>,
    clock: Arc<MachineClock>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, vfs: Arc<VirtualFs>, clock: Arc<MachineClock>) -> Self {
        Self {
            catalog,
            vfs,
            clock,
        }
    }

    /// Resolves one framed command and decides what happens next.
    pub fn dispatch(&self, conn: &mut ConnectionState, line: &str) -> Outcome {
        let line = line.trim();
        if line.is_empty() {
            return Outcome::Silent;
        }

        let Some((key, descriptor)) = self.catalog.resolve_line(line) else {
            trace_recv(line, false);
            warn!(peer = %conn.peer, command = %line, "unsupported command");
            return Outcome::Reply(Reply::error("unsupported command", None));
        };
        trace_recv(line, descriptor.debug_output_only);

        match key {
            "upload" | "download" => self.plan_transfer(conn, key, descriptor, line),
            "time" => Outcome::Reply(self.handle_time(descriptor, line)),
            "ls" | "pwd" | "cd" | "cat" | "mv" | "rm" | "mkdir" => {
                Outcome::Reply(self.handle_filesystem(conn, key, descriptor, line))
            }
            _ => Outcome::Reply(Reply::shaped(&descriptor.response, descriptor)),
        }
    }

    fn plan_transfer(
        &self,
        conn: &ConnectionState,
        key: &str,
        descriptor: &CommandDescriptor,
        line: &str,
    ) -> Outcome {
        let Some(path) = argument_paths(line).first().cloned() else {
            return Outcome::Reply(Reply::error(
                &format!("{key} requires a file path"),
                Some(descriptor),
            ));
        };
        let direction = if key == "upload" {
            TransferDirection::Upload
        } else {
            TransferDirection::Download
        };
        info!(peer = %conn.peer, %path, ?direction, "starting XMODEM transfer");
        Outcome::Transfer(TransferPlan {
            direction,
            cwd: conn.cwd.clone(),
            path,
            descriptor: descriptor.clone(),
        })
    }

    fn handle_time(&self, descriptor: &CommandDescriptor, line: &str) -> Reply {
        if let Some((_, value)) = line.split_once('=') {
            let parsed: Result<f64, _> = value.trim().parse();
            match parsed.map_err(|_| ()).and_then(|epoch| {
                self.clock.set(epoch).map_err(|_| ())?;
                info!(epoch = %value.trim(), "machine time anchored");
                Ok(())
            }) {
                Ok(()) => Reply::shaped("", descriptor),
                Err(()) => Reply::error("invalid time value", Some(descriptor)),
            }
        } else {
            match self.clock.now_epoch() {
                Ok(epoch) => Reply::shaped(&epoch.to_string(), descriptor),
                Err(err) => Reply::error(&err.to_string(), Some(descriptor)),
            }
        }
    }

    fn handle_filesystem(
        &self,
        conn: &mut ConnectionState,
        key: &str,
        descriptor: &CommandDescriptor,
        line: &str,
    ) -> Reply {
        let paths = argument_paths(line);
        let result = match key {
            "ls" => {
                let with_sizes = line.split_whitespace().any(|part| part == "-s");
                let path = paths.first().map_or(conn.cwd.clone(), Clone::clone);
                self.vfs.list(&conn.cwd, &path, with_sizes)
            }
            "pwd" => Ok(conn.cwd.clone()),
            "cd" => {
                let Some(path) = paths.first() else {
                    return Reply::error("cd requires a directory path", Some(descriptor));
                };
                match self.vfs.cd(&conn.cwd, path) {
                    Ok(cwd) => {
                        conn.cwd = cwd;
                        Ok(String::new())
                    }
                    Err(err) => Err(err),
                }
            }
            "cat" => {
                let Some(path) = paths.first() else {
                    return Reply::error("cat requires a file path", Some(descriptor));
                };
                // A non-numeric limit is ignored, like the hardware does.
                let limit = paths.get(1).and_then(|raw| raw.parse().ok());
                self.vfs.cat(&conn.cwd, path, limit)
            }
            "mv" => {
                let (Some(src), Some(dst)) = (paths.first(), paths.get(1)) else {
                    return Reply::error(
                        "mv requires source and destination paths",
                        Some(descriptor),
                    );
                };
                self.vfs.mv(&conn.cwd, src, dst).map(|()| String::new())
            }
            "rm" => {
                let Some(path) = paths.first() else {
                    return Reply::error("rm requires a file path", Some(descriptor));
                };
                self.vfs.rm(&conn.cwd, path).map(|()| String::new())
            }
            "mkdir" => {
                let Some(path) = paths.first() else {
                    return Reply::error("mkdir requires a directory path", Some(descriptor));
                };
                self.vfs.mkdir(&conn.cwd, path).map(|()| String::new())
            }
            _ => unreachable!("caller routes only filesystem keys"),
        };

        match result {
            Ok(body) => Reply::shaped(&body, descriptor),
            Err(err) => Reply::error(&err.to_string(), Some(descriptor)),
        }
    }

    /// Shapes the reply that follows a finished transfer.
    #[must_use]
    pub fn transfer_reply(&self, plan: &TransferPlan, body: &str) -> Reply {
        if body.is_empty() {
            Reply::shaped("", &plan.descriptor)
        } else {
            let message = body.strip_prefix("error:").unwrap_or(body);
            Reply::error(message, Some(&plan.descriptor))
        }
    }

    #[must_use]
    pub fn vfs(&self) -> &VirtualFs {
        &self.vfs
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

/// Non-flag arguments after the command word.
fn argument_paths(line: &str) -> Vec<String> {
    line.split_whitespace()
        .skip(1)
        .filter(|part| !part.starts_with('-'))
        .map(ToString::to_string)
        .collect()
}

fn floor_delay() -> Duration {
    Duration::from_millis(gantry_core::catalog::DEFAULT_TIME_MS)
}

fn delay_for(descriptor: &CommandDescriptor) -> Duration {
    Duration::from_millis(descriptor.time_ms.max(gantry_core::catalog::DEFAULT_TIME_MS))
}

/// Width of the `RECV: ` / `SEND: ` tag, so continuation lines of a
/// multi-line body line up under the first.
const WIRE_TAG_WIDTH: usize = 6;

fn align_multiline(body: &str) -> String {
    if !body.contains('\n') {
        return body.to_string();
    }
    let pad = " ".repeat(WIRE_TAG_WIDTH);
    let mut lines = body.split('\n');
    let mut out = lines.next().unwrap_or_default().to_string();
    for line in lines {
        out.push('\n');
        out.push_str(&pad);
        out.push_str(line);
    }
    out
}

fn trace_recv(line: &str, debug_only: bool) {
    if debug_only {
        debug!("RECV: {}", align_multiline(line));
    } else {
        info!("RECV: {}", align_multiline(line));
    }
}

/// Emits the SEND trace for a reply body at the descriptor's level.
pub fn trace_send(body: &str, debug_only: bool) {
    if debug_only {
        debug!("SEND: {}", align_multiline(body));
    } else {
        info!("SEND: {}", align_multiline(body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        let catalog =
            Catalog::from_json(crate::COMMAND_CATALOG_JSON).expect("embedded catalog parses");
        let vfs = VirtualFs::from_json(crate::VIRTUAL_FILES_JSON);
        Dispatcher::new(
            Arc::new(catalog),
            Arc::new(vfs),
            Arc::new(MachineClock::new()),
        )
    }

    fn conn() -> ConnectionState {
        ConnectionState::new("127.0.0.1:9999".parse().unwrap())
    }

    fn reply(dispatcher: &Dispatcher, conn: &mut ConnectionState, line: &str) -> Reply {
        match dispatcher.dispatch(conn, line) {
            Outcome::Reply(reply) => reply,
            other => panic!("expected a reply for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn version_gets_body_and_floor_delay() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "version");
        assert_eq!(r.bytes, b"version = 1.0.3c1.0.6\n");
        assert_eq!(r.delay, Duration::from_millis(100));
        assert!(!r.debug_only);
    }

    #[test]
    fn g_code_acknowledges_with_ok_only() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "G0 X10 Y5 F100");
        assert_eq!(r.bytes, b"ok\n");
    }

    #[test]
    fn slow_commands_keep_their_catalog_delay() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "$H");
        assert_eq!(r.delay, Duration::from_millis(4000));
        assert_eq!(r.bytes, b"ok\n");
    }

    #[test]
    fn status_query_is_debug_traced() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "?");
        assert!(r.debug_only);
        assert!(r.bytes.starts_with(b"<Idle|MPos:-1.0000,-1.0000,-1.0000"));
        assert!(r.bytes.ends_with(b">\n"));
    }

    #[test]
    fn unknown_command_is_reported_and_survivable() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "frobnicate");
        assert_eq!(r.bytes, b"error:unsupported command\n");
    }

    #[test]
    fn blank_input_is_silent() {
        let d = dispatcher();
        assert!(matches!(d.dispatch(&mut conn(), "  "), Outcome::Silent));
    }

    #[test]
    fn ls_body_is_eot_terminated_without_ok() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "ls /sd");
        assert_eq!(r.bytes, b"config.txt\ngcodes/\n\x04");
        assert_eq!(r.log_body, "config.txt\ngcodes/");
    }

    #[test]
    fn ls_with_sizes_flag() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "ls -s /sd/gcodes");
        let body = String::from_utf8_lossy(&r.bytes).to_string();
        let size: u64 = body
            .lines()
            .find_map(|line| line.strip_prefix("face_top.nc "))
            .expect("face_top.nc listed with a size")
            .trim()
            .parse()
            .expect("size is numeric");
        assert!(size > 0);
        assert!(body.ends_with('\u{4}'));
    }

    #[test]
    fn mkdir_acknowledges_then_lists() {
        let d = dispatcher();
        let mut c = conn();
        let r = reply(&d, &mut c, "mkdir /sd/new");
        assert_eq!(r.bytes, b"ok\n\x04");
        let r = reply(&d, &mut c, "ls /sd");
        assert!(String::from_utf8_lossy(&r.bytes).contains("new/"));
    }

    #[test]
    fn cd_changes_cwd_and_pwd_reports_it() {
        let d = dispatcher();
        let mut c = conn();
        let r = reply(&d, &mut c, "cd /sd/gcodes");
        assert_eq!(r.bytes, b"");
        assert_eq!(c.cwd, "/sd/gcodes");
        let r = reply(&d, &mut c, "pwd");
        assert_eq!(r.bytes, b"/sd/gcodes\n");
    }

    #[test]
    fn filesystem_errors_keep_the_sentinel_but_not_ok() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "cat /nope");
        assert_eq!(r.bytes, b"error:/nope not found\n\x04");
        let r = reply(&d, &mut conn(), "mkdir /sd/gcodes");
        assert_eq!(r.bytes, b"error:/sd/gcodes already exists\n\x04");
        let r = reply(&d, &mut conn(), "mv /sd/config.txt");
        assert_eq!(r.bytes, b"error:mv requires source and destination paths\n\x04");
    }

    #[test]
    fn time_set_then_query_round_trips() {
        let d = dispatcher();
        let mut c = conn();
        let r = reply(&d, &mut c, "time = 1751357510");
        assert_eq!(r.bytes, b"");
        let r = reply(&d, &mut c, "time");
        let body = String::from_utf8_lossy(&r.bytes);
        let epoch: u64 = body.trim().parse().expect("epoch digits");
        assert!((1_751_357_510..1_751_357_512).contains(&epoch));
    }

    #[test]
    fn time_rejects_garbage_and_uninitialized_queries() {
        let d = dispatcher();
        let mut c = conn();
        let r = reply(&d, &mut c, "time");
        assert_eq!(r.bytes, b"error:time not initialized\n");
        let r = reply(&d, &mut c, "time = soon");
        assert_eq!(r.bytes, b"error:invalid time value\n");
        let r = reply(&d, &mut c, "time = -5");
        assert_eq!(r.bytes, b"error:invalid time value\n");
    }

    #[test]
    fn upload_without_a_path_is_an_error_not_a_transfer() {
        let d = dispatcher();
        let r = reply(&d, &mut conn(), "upload");
        assert_eq!(r.bytes, b"error:upload requires a file path\n");
    }

    #[test]
    fn download_plans_a_transfer_with_the_cwd_snapshot() {
        let d = dispatcher();
        let mut c = conn();
        reply(&d, &mut c, "cd /sd");
        match d.dispatch(&mut c, "download gcodes/face_top.nc") {
            Outcome::Transfer(plan) => {
                assert_eq!(plan.direction, TransferDirection::Download);
                assert_eq!(plan.cwd, "/sd");
                assert_eq!(plan.path, "gcodes/face_top.nc");
            }
            other => panic!("expected a transfer plan, got {other:?}"),
        }
    }

    #[test]
    fn multiline_bodies_align_under_the_wire_tag() {
        let aligned = align_multiline("line one\nline two");
        assert_eq!(aligned, "line one\n      line two");
        assert_eq!(align_multiline("solo"), "solo");
    }
}
