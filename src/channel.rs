use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::TamperConfig;
use crate::error::TamperError;
use crate::matrix::ProbeSpec;
use crate::privileged::PendingCommand;
use crate::privileged::PollPolicy;
use crate::privileged::PrivilegedRunner;
use crate::privileged::wait_for;
use crate::wire::WireRequest;
use crate::wire::WireResponse;
use crate::wire::decode_response;
use crate::wire::encode_request;
use crate::wire::read_frame;
use crate::wire::write_frame;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn accept_helper(
    listener: &TcpListener,
    helper: &mut dyn PendingCommand,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), TamperError> {
    listener.set_nonblocking(true)?;
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                return Ok((stream, peer));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => (),
            Err(e) => return Err(e.into()),
        }
        if let Some(status) = helper.try_status()? {
            return Err(TamperError::HelperExited { status });
        }
        if start.elapsed() >= timeout {
            return Err(TamperError::HelperAcceptTimeout {
                addr: listener.local_addr()?.to_string(),
                timeout_ms: timeout.as_millis(),
            });
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }
}

fn is_read_timeout(e: &TamperError) -> bool {
    match e {
        TamperError::IOError(io) => {
            matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        }
        _ => false,
    }
}

/// One launched helper and its connection.
struct HelperSession {
    stream: TcpStream,
    helper: Box<dyn PendingCommand>,
}

impl HelperSession {
    fn close(mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown helper stream: {}", e);
        }
        if let Err(e) = self.helper.kill() {
            warn!("kill helper [{}] failed: {}", self.helper.command(), e);
        }
    }
}

/// The helper process and the local link to it.
/// Exactly one request is in flight at a time, `run_probe` takes `&mut self`.
pub struct ProbeChannel {
    listener: TcpListener,
    helper_path: PathBuf,
    accept_timeout: Duration,
    probe_timeout: Duration,
    finish_policy: PollPolicy,
    /// `None` after the helper went away, until `reopen` launches a new one.
    session: Option<HelperSession>,
    next_seq: u32,
}

impl ProbeChannel {
    /// Listen on loopback, launch the helper with our address and wait for it to connect back.
    pub fn start(
        runner: &mut dyn PrivilegedRunner,
        helper_path: &Path,
        config: &TamperConfig,
    ) -> Result<ProbeChannel, TamperError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        debug!("local socket address: {}", listener.local_addr()?);
        let mut channel = ProbeChannel {
            listener,
            helper_path: helper_path.to_path_buf(),
            accept_timeout: config.accept_timeout(),
            probe_timeout: config.probe_timeout(),
            finish_policy: PollPolicy::new(
                config.poll_interval(),
                config.max_poll_interval(),
                config.finish_timeout(),
            ),
            session: None,
            next_seq: 1,
        };
        channel.launch(runner)?;
        Ok(channel)
    }
    fn launch(&mut self, runner: &mut dyn PrivilegedRunner) -> Result<(), TamperError> {
        let local_addr = self.listener.local_addr()?;
        let cmd = format!("'{}' {}", self.helper_path.display(), local_addr);
        let mut helper = runner.submit(&cmd)?;
        let (stream, peer) = match accept_helper(&self.listener, helper.as_mut(), self.accept_timeout)
        {
            Ok(s) => s,
            Err(e) => {
                error!("helper did not connect back: {}", e);
                if let Err(ke) = helper.kill() {
                    warn!("kill helper failed: {}", ke);
                }
                return Err(e);
            }
        };
        stream.set_read_timeout(Some(self.probe_timeout))?;
        stream.set_nodelay(true)?;
        info!("helper connected from {}", peer);
        self.session = Some(HelperSession { stream, helper });
        Ok(())
    }
    pub fn local_addr(&self) -> Result<SocketAddr, TamperError> {
        Ok(self.listener.local_addr()?)
    }
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }
    /// Launch a new helper on the same listener if the previous one went away.
    pub fn reopen(&mut self, runner: &mut dyn PrivilegedRunner) -> Result<(), TamperError> {
        if self.session.is_some() {
            return Ok(());
        }
        warn!("helper connection lost, restarting it");
        self.launch(runner)
    }
    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
    /// Send one probe request and block for its response.
    /// Late answers to earlier requests are skipped, a read timeout keeps the session.
    pub fn run_probe(&mut self, spec: &ProbeSpec) -> Result<WireResponse, TamperError> {
        let mut req = WireRequest::new(
            spec.opcode,
            spec.extra.unwrap_or(0),
            SocketAddr::new(spec.src_addr, spec.src_port),
            SocketAddr::new(spec.dst_addr, spec.dst_port),
        )?;
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Err(TamperError::ChannelClosed),
        };
        req.seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let exchange = write_frame(&mut session.stream, &encode_request(&req)).and_then(|_| loop {
            let body = read_frame(&mut session.stream)?;
            let resp = decode_response(&body)?;
            if resp.seq == req.seq {
                break Ok(resp);
            }
            debug!("discard late answer to request {}", resp.seq);
        });
        let resp = match exchange {
            Ok(r) => r,
            Err(e) if is_read_timeout(&e) => {
                warn!("probe {} got no answer in time", spec);
                return Err(TamperError::ProbeTimeout {
                    seq: req.seq,
                    timeout_ms: self.probe_timeout.as_millis(),
                });
            }
            // the frame was read whole, the stream is still in step
            Err(e @ TamperError::MalformedFrame { .. }) => return Err(e),
            Err(e) => {
                error!("helper connection failed: {}", e);
                self.drop_session();
                return Err(e);
            }
        };
        debug!(
            "probe {} answered success: {}, payload: {:?}",
            spec,
            resp.success,
            resp.payload.as_ref().map(hex::encode)
        );
        Ok(resp)
    }
    /// Ask the helper to exit and wait for it.
    /// The helper is killed if it does not go away within the finish timeout.
    pub fn finish(mut self) -> Result<(), TamperError> {
        let mut session = match self.session.take() {
            Some(s) => s,
            None => {
                debug!("no helper left to finish");
                return Ok(());
            }
        };
        if let Err(e) = write_frame(&mut session.stream, &encode_request(&WireRequest::quit())) {
            warn!("send quit to helper failed: {}", e);
        }
        if let Err(e) = session.stream.shutdown(Shutdown::Both) {
            debug!("shutdown helper stream: {}", e);
        }
        let status = wait_for(session.helper.as_mut(), &self.finish_policy)?;
        if status != 0 {
            warn!("helper exited with status {}", status);
        }
        debug!("helper finished, releasing {}", self.listener.local_addr()?);
        Ok(())
    }
}
