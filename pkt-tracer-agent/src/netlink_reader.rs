//! Fan-out netlink reader (spec §4.1): one raw socket on the netfilter
//! family subscribed to the `NFTRACE`/`NFTABLES` multicast groups, read from
//! a single dedicated blocking task and broadcast to every consumer.
//!
//! Consumers are cooperative: the reader blocks on each consumer channel in
//! turn, so a slow consumer backpressures the others rather than dropping
//! frames silently.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pkt_tracer_types::metrics::Telemetry;
use pkt_tracer_types::netlink::{self, Frame, NftEvent, ReadError};

pub(crate) const NFNL_SUBSYS_NFTABLES: u16 = 10;
pub(crate) const NLMSG_HDR_LEN: usize = 16;
pub(crate) const NFGENMSG_LEN: usize = 4;

/// `NFT_MSG_*` values, shared with `kernel_source`'s startup dump requests —
/// a dump response carries the same message subtype as its multicast
/// counterpart (e.g. `GETRULE`'s responses are `NEWRULE` messages).
pub(crate) mod nft_msg {
    pub const NEWTABLE: u16 = 0;
    pub const GETTABLE: u16 = 1;
    pub const DELTABLE: u16 = 2;
    pub const NEWCHAIN: u16 = 3;
    pub const GETCHAIN: u16 = 4;
    pub const DELCHAIN: u16 = 5;
    pub const NEWRULE: u16 = 6;
    pub const GETRULE: u16 = 7;
    pub const DELRULE: u16 = 8;
    pub const NEWSET: u16 = 9;
    pub const GETSET: u16 = 10;
    pub const DELSET: u16 = 11;
    pub const NEWSETELEM: u16 = 12;
    pub const GETSETELEM: u16 = 13;
    pub const DELSETELEM: u16 = 14;
    pub const TRACE: u16 = 17;
}

/// Splits a raw netlink read buffer into its (possibly several, coalesced)
/// `(full nlmsg_type, nfgenmsg+attrs body)` messages, without interpreting
/// them. Shared by the multicast fan-out reader and the startup dump
/// enumerator.
pub(crate) fn iter_nlmsgs(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut cursor = buf;
    while cursor.len() >= NLMSG_HDR_LEN {
        let len = u32::from_ne_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
        let nl_type = u16::from_ne_bytes([cursor[4], cursor[5]]);
        if len < NLMSG_HDR_LEN || len > cursor.len() {
            break;
        }
        out.push((nl_type, &cursor[NLMSG_HDR_LEN..len]));
        let aligned = (len + 3) & !3;
        if aligned >= cursor.len() {
            break;
        }
        cursor = &cursor[aligned..];
    }
    out
}

/// Classifies one already-split `(nl_type, body)` message into a [`Frame`],
/// or `None` for subsystems/subtypes this pipeline doesn't react to.
pub(crate) fn classify(nl_type: u16, body: &[u8]) -> Option<Frame> {
    let subsys = (nl_type >> 8) & 0xff;
    let msg = nl_type & 0xff;
    if subsys != NFNL_SUBSYS_NFTABLES || body.len() < NFGENMSG_LEN {
        return None;
    }
    // `nfgenmsg`: family (1 byte), version (1 byte), res_id (2 bytes), then
    // the attribute TLV stream. Trace frames carry family in an attribute
    // already (spec §6) so only the attrs are kept; table frames don't, so
    // the family byte is prefixed onto the payload for `table_watcher` to
    // read back off before parsing attrs.
    let family = body[0];
    let attrs = &body[NFGENMSG_LEN..];
    match msg {
        m if m == nft_msg::NEWTABLE => Some(table_frame(NftEvent::NewTable, family, attrs)),
        m if m == nft_msg::DELTABLE => Some(table_frame(NftEvent::DelTable, family, attrs)),
        m if m == nft_msg::NEWCHAIN => Some(table_frame(NftEvent::NewChain, family, attrs)),
        m if m == nft_msg::DELCHAIN => Some(table_frame(NftEvent::DelChain, family, attrs)),
        m if m == nft_msg::NEWRULE => Some(table_frame(NftEvent::NewRule, family, attrs)),
        m if m == nft_msg::DELRULE => Some(table_frame(NftEvent::DelRule, family, attrs)),
        m if m == nft_msg::NEWSET => Some(table_frame(NftEvent::NewSet, family, attrs)),
        m if m == nft_msg::DELSET => Some(table_frame(NftEvent::DelSet, family, attrs)),
        m if m == nft_msg::NEWSETELEM => Some(table_frame(NftEvent::NewSetElem, family, attrs)),
        m if m == nft_msg::DELSETELEM => Some(table_frame(NftEvent::DelSetElem, family, attrs)),
        m if m == nft_msg::TRACE => Some(Frame::Trace(attrs.to_vec())),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open netlink socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to configure netlink socket: {0}")]
    SetSockOpt(#[source] std::io::Error),
    #[error("fatal netlink read error: {0}")]
    Fatal(ReadError),
}

fn table_frame(event: NftEvent, family: u8, attrs: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(1 + attrs.len());
    payload.push(family);
    payload.extend_from_slice(attrs);
    Frame::Table(event, payload)
}

/// Splits one `recv()` buffer into its (possibly several, coalesced)
/// netlink messages and classifies each into a [`Frame`] this reader's
/// consumers understand. Messages outside the nftables nfnetlink subsystem,
/// and subtypes this pipeline doesn't react to (`GETTABLE`, `NEWGEN`, ...),
/// are silently skipped.
fn parse_frames(buf: &[u8]) -> Vec<Frame> {
    const NLMSG_HDR_LEN: usize = 16;
    const NFGENMSG_LEN: usize = 4;
    let mut out = Vec::new();
    let mut cursor = buf;
    while cursor.len() >= NLMSG_HDR_LEN {
        let len = u32::from_ne_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
        let nl_type = u16::from_ne_bytes([cursor[4], cursor[5]]);
        if len < NLMSG_HDR_LEN || len > cursor.len() {
            break;
        }
        let body = &cursor[NLMSG_HDR_LEN..len];
        let subsys = (nl_type >> 8) & 0xff;
        let msg = nl_type & 0xff;
        if subsys == NFNL_SUBSYS_NFTABLES && body.len() >= NFGENMSG_LEN {
            // `nfgenmsg`: family (1 byte), version (1 byte), res_id (2 bytes),
            // then the attribute TLV stream. Trace frames carry family in an
            // attribute already (spec §6) so only the attrs are kept; table
            // frames don't, so the family byte is prefixed onto the payload
            // for `table_watcher` to read back off before parsing attrs.
            let family = body[0];
            let attrs = &body[NFGENMSG_LEN..];
            let frame = match msg {
                m if m == nft_msg::NEWTABLE => Some(table_frame(NftEvent::NewTable, family, attrs)),
                m if m == nft_msg::DELTABLE => Some(table_frame(NftEvent::DelTable, family, attrs)),
                m if m == nft_msg::NEWCHAIN => Some(table_frame(NftEvent::NewChain, family, attrs)),
                m if m == nft_msg::DELCHAIN => Some(table_frame(NftEvent::DelChain, family, attrs)),
                m if m == nft_msg::NEWRULE => Some(table_frame(NftEvent::NewRule, family, attrs)),
                m if m == nft_msg::DELRULE => Some(table_frame(NftEvent::DelRule, family, attrs)),
                m if m == nft_msg::NEWSET => Some(table_frame(NftEvent::NewSet, family, attrs)),
                m if m == nft_msg::DELSET => Some(table_frame(NftEvent::DelSet, family, attrs)),
                m if m == nft_msg::NEWSETELEM => Some(table_frame(NftEvent::NewSetElem, family, attrs)),
                m if m == nft_msg::DELSETELEM => Some(table_frame(NftEvent::DelSetElem, family, attrs)),
                m if m == nft_msg::TRACE => Some(Frame::Trace(attrs.to_vec())),
                _ => None,
            };
            if let Some(frame) = frame {
                out.push(frame);
            }
        }
        let aligned = (len + 3) & !3;
        if aligned >= cursor.len() {
            break;
        }
        cursor = &cursor[aligned..];
    }
    out
}

fn open_socket(rcvbuf: u32) -> Result<libc::c_int, Error> {
    // SAFETY: straight-line libc socket setup, every return value checked.
    unsafe {
        let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_NETFILTER);
        if fd < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }

        let rcvbuf = rcvbuf as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &rcvbuf as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::SetSockOpt(err));
        }

        // Bounded timeout so the blocking read loop can observe cancellation
        // between reads instead of blocking forever (spec §4.1 "bounded-timeout
        // select").
        let timeout = libc::timeval { tv_sec: 0, tv_usec: 200_000 };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::SetSockOpt(err));
        }

        let mut addr: libc::sockaddr_nl = std::mem::zeroed();
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = netlink::group::NFTRACE | netlink::group::NFTABLES;
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        );
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Bind(err));
        }

        Ok(fd)
    }
}

/// Increments `err_nl_mem_counter` for a netlink buffer overrun observed on
/// this reader's socket (spec §7, testable property 14).
fn record_overrun(telemetry: &Telemetry) {
    telemetry.err_nl_mem_counter.with_label_values(&["collector"]).inc();
}

/// Blocks until every consumer has accepted `batch`, giving the slowest
/// consumer's channel capacity as the effective backpressure point for the
/// whole reader (spec §4.1).
fn broadcast(senders: &[mpsc::Sender<Vec<Frame>>], batch: Vec<Frame>) -> bool {
    for tx in senders {
        if tx.blocking_send(batch.clone()).is_err() {
            return false;
        }
    }
    true
}

fn read_loop(
    fd: libc::c_int,
    senders: Vec<mpsc::Sender<Vec<Frame>>>,
    cancel: CancellationToken,
    telemetry: Telemetry,
) -> Result<(), Error> {
    let mut buf = vec![0u8; 32 * 1024];
    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        // SAFETY: `buf` is live for the duration of the call and sized as passed.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
            match ReadError::classify(errno) {
                ReadError::NotReady | ReadError::Interrupted => continue,
                ReadError::BufferOverrun => {
                    record_overrun(&telemetry);
                    tracing::warn!("netlink receive buffer overrun, continuing");
                    continue;
                }
                fatal @ ReadError::Fatal(_) => break Err(Error::Fatal(fatal)),
            }
        }
        let frames = parse_frames(&buf[..n as usize]);
        if !frames.is_empty() && !broadcast(&senders, frames) {
            // every consumer dropped its receiver: nothing left to feed.
            break Ok(());
        }
    };
    // Dropping `senders` here closes every consumer channel, the reader's
    // half of cooperative shutdown (spec §4.1).
    drop(senders);
    unsafe { libc::close(fd) };
    result
}

/// Opens the socket and spawns the blocking read loop, returning one
/// receiver per requested consumer plus a join handle the supervisor can
/// wait on for first-error cancellation.
pub fn spawn(
    rcvbuf: u32,
    n_consumers: usize,
    channel_capacity: usize,
    cancel: CancellationToken,
    telemetry: Telemetry,
) -> Result<(Vec<mpsc::Receiver<Vec<Frame>>>, tokio::task::JoinHandle<Result<(), Error>>), Error> {
    let fd = open_socket(rcvbuf)?;
    let mut senders = Vec::with_capacity(n_consumers);
    let mut receivers = Vec::with_capacity(n_consumers);
    for _ in 0..n_consumers {
        let (tx, rx) = mpsc::channel(channel_capacity);
        senders.push(tx);
        receivers.push(rx);
    }
    let handle = tokio::task::spawn_blocking(move || read_loop(fd, senders, cancel, telemetry));
    let handle = tokio::spawn(async move {
        handle.await.unwrap_or_else(|e| Err(Error::Fatal(ReadError::Fatal(e.to_string()))))
    });
    Ok((receivers, handle))
}

#[allow(dead_code)]
fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlmsg(nl_type: u16, body: &[u8]) -> Vec<u8> {
        let total = 16 + body.len();
        let mut v = Vec::new();
        v.extend_from_slice(&(total as u32).to_ne_bytes());
        v.extend_from_slice(&nl_type.to_ne_bytes());
        v.extend_from_slice(&0u16.to_ne_bytes()); // flags
        v.extend_from_slice(&0u32.to_ne_bytes()); // seq
        v.extend_from_slice(&0u32.to_ne_bytes()); // pid
        v.extend_from_slice(body);
        while v.len() % 4 != 0 {
            v.push(0);
        }
        v
    }

    fn nfgenmsg_with_attrs(attrs: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend_from_slice(attrs);
        v
    }

    #[test]
    fn parses_newrule_event_from_nftables_subsystem() {
        let nl_type = (NFNL_SUBSYS_NFTABLES << 8) | nft_msg::NEWRULE;
        let body = nfgenmsg_with_attrs(b"");
        let buf = nlmsg(nl_type, &body);
        let frames = parse_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Table(NftEvent::NewRule, _)));
    }

    #[test]
    fn parses_trace_event_as_trace_frame() {
        let nl_type = (NFNL_SUBSYS_NFTABLES << 8) | nft_msg::TRACE;
        let body = nfgenmsg_with_attrs(b"");
        let buf = nlmsg(nl_type, &body);
        let frames = parse_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Trace(_)));
    }

    #[test]
    fn ignores_subtypes_outside_nftables_subsystem() {
        let nl_type = (99u16 << 8) | nft_msg::NEWRULE;
        let body = nfgenmsg_with_attrs(b"");
        let buf = nlmsg(nl_type, &body);
        assert!(parse_frames(&buf).is_empty());
    }

    #[test]
    fn parses_multiple_coalesced_messages_in_one_buffer() {
        let nl_type_table = (NFNL_SUBSYS_NFTABLES << 8) | nft_msg::NEWTABLE;
        let nl_type_chain = (NFNL_SUBSYS_NFTABLES << 8) | nft_msg::NEWCHAIN;
        let mut buf = nlmsg(nl_type_table, &nfgenmsg_with_attrs(b""));
        buf.extend(nlmsg(nl_type_chain, &nfgenmsg_with_attrs(b"")));
        let frames = parse_frames(&buf);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Table(NftEvent::NewTable, _)));
        assert!(matches!(frames[1], Frame::Table(NftEvent::NewChain, _)));
    }

    #[test]
    fn truncated_trailing_message_is_dropped_without_panicking() {
        let nl_type = (NFNL_SUBSYS_NFTABLES << 8) | nft_msg::NEWTABLE;
        let mut buf = nlmsg(nl_type, &nfgenmsg_with_attrs(b""));
        buf.push(0); // trailing garbage shorter than a header
        buf.push(0);
        let frames = parse_frames(&buf);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn buffer_overrun_increments_the_telemetry_counter() {
        let telemetry = Telemetry::new();
        record_overrun(&telemetry);
        assert_eq!(telemetry.err_nl_mem_counter.with_label_values(&["collector"]).get(), 1.0);
    }
}
