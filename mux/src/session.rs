use crate::frame::Frame;
use crate::obfs::{Deobfser, ObfsedRead, Obfser, RawConn};
use crate::valve::Valve;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A multiplexed logical stream of one user.
///
/// Every byte the session moves is accounted against the valve it was built
/// with, which is shared with all other sessions of the same user.
pub struct Session {
    id: u32,
    valve: Arc<Valve>,
    obfs: Obfser,
    deobfs: Deobfser,
    obfsed_read: Arc<dyn ObfsedRead>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        id: u32,
        valve: Arc<Valve>,
        obfs: Obfser,
        deobfs: Deobfser,
        obfsed_read: Arc<dyn ObfsedRead>,
    ) -> Self {
        Self {
            id,
            valve,
            obfs,
            deobfs,
            obfsed_read,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn valve(&self) -> &Arc<Valve> {
        &self.valve
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the session closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        if was_open {
            debug!(session_id = self.id, "session closed");
        }
        was_open
    }

    /// Obfuscates `frame` and writes it to `conn` once the valve lets the
    /// bytes through. Returns the number of bytes put on the wire.
    pub async fn write_frame<W>(&self, conn: &mut W, frame: &Frame) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.ensure_open()?;
        let wire = (self.obfs)(frame)?;
        self.valve.tx_wait(wire.len()).await;
        conn.write_all(&wire).await?;
        Ok(wire.len())
    }

    /// Reads one record from `conn`, accounts for it and deobfuscates it.
    pub async fn read_frame(&self, conn: &mut RawConn, buf: &mut [u8]) -> io::Result<Frame> {
        self.ensure_open()?;
        let n = self.obfsed_read.read_obfsed(conn, buf).await?;
        self.valve.rx_wait(n).await;
        (self.deobfs)(&buf[..n])
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("session {} is closed", self.id),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("valve", &self.valve)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_HEADER_LEN;
    use crate::obfs::{LengthPrefixedRead, plain_deobfser, plain_obfser};

    fn plain_session(id: u32, valve: Arc<Valve>) -> Session {
        Session::new(
            id,
            valve,
            plain_obfser(),
            plain_deobfser(),
            Arc::new(LengthPrefixedRead),
        )
    }

    #[tokio::test]
    async fn frames_cross_the_valve_both_ways() {
        let valve = Arc::new(Valve::new(0, 0, 1000, 1000));
        let sender = plain_session(1, valve.clone());
        let receiver = plain_session(2, valve.clone());
        assert!(Arc::ptr_eq(sender.valve(), receiver.valve()));

        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new(4, 1, &b"payload"[..]);
        let written = sender.write_frame(&mut client, &frame).await.unwrap();
        assert_eq!(written, 2 + FRAME_HEADER_LEN + 7);
        assert_eq!(valve.tx_credit(), 1000 - written as i64);

        let mut buf = [0u8; 128];
        let read = receiver.read_frame(&mut server, &mut buf).await.unwrap();
        assert_eq!(read, frame);
        assert_eq!(valve.rx_credit(), 1000 - (written as i64 - 2));
    }

    #[tokio::test]
    async fn closed_session_refuses_io() {
        let session = plain_session(1, Arc::new(Valve::unlimited()));
        assert!(session.close());
        assert!(!session.close());

        let (mut client, mut server) = tokio::io::duplex(64);
        let err = session
            .write_frame(&mut client, &Frame::closing(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut buf = [0u8; 64];
        let err = session.read_frame(&mut server, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn transport_error_reaches_caller_untouched() {
        let valve = Arc::new(Valve::new(0, 0, 100, 100));
        let session = plain_session(1, valve.clone());
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut buf = [0u8; 64];
        let err = session.read_frame(&mut server, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(valve.rx_credit(), 100);
    }
}
