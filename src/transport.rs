//! The wire channel: a frame-oriented transport trait, plus an adapter that
//! re-frames an H4 (UART) byte stream.

use core::cell::RefCell;

/// Largest event frame: two-byte header plus 255 parameter bytes.
pub const MAX_EVENT_FRAME_LEN: usize = 257;

/// H4 packet indicators for the two packet types a control channel carries.
const H4_COMMAND: u8 = 0x01;
const H4_EVENT: u8 = 0x04;

/// A bidirectional frame pipe to the controller.
///
/// Writes are fire-and-forget; reads deliver one whole event frame per call.
/// `read_frame` must be cancel-safe: dropping its future and calling it again
/// must not lose wire bytes, since the caller races it against timers.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Write one complete command packet.
    fn write_frame(&self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Receive one complete event frame into `buf`, returning its length.
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Errors of the H4 byte-stream adapter.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum H4Error<E> {
    Io(E),
    /// The stream ended mid-packet.
    UnexpectedEof,
    /// A packet indicator other than the event indicator arrived on the
    /// control channel.
    UnexpectedIndicator(u8),
    /// The advertised frame does not fit the caller's buffer.
    FrameTooLong(usize),
}

/// Receive progress, persisted across cancelled `read_frame` calls.
///
/// Each suspension point is a single `read`, and progress is recorded after
/// it completes; a dropped future therefore never loses consumed bytes, and
/// the next call resumes mid-frame.
struct RxState<R> {
    rx: R,
    frame: [u8; MAX_EVENT_FRAME_LEN],
    /// Frame bytes received so far (header included, indicator not).
    filled: usize,
    indicator_seen: bool,
}

/// Frames an H4 serial byte stream: a one-byte packet indicator, then the
/// event header, then as many parameter bytes as the header's length field
/// says.
///
/// Only one `read_frame` may be in flight at a time; the multiplexer's run
/// loop is the single reader.
pub struct H4Transport<R, W> {
    rx: RefCell<RxState<R>>,
    tx: RefCell<W>,
}

impl<E, R, W> H4Transport<R, W>
where
    E: core::fmt::Debug,
    R: embedded_io_async::Read<Error = E>,
    W: embedded_io::Write<Error = E>,
{
    pub fn new(rx: R, tx: W) -> Self {
        H4Transport {
            rx: RefCell::new(RxState {
                rx,
                frame: [0; MAX_EVENT_FRAME_LEN],
                filled: 0,
                indicator_seen: false,
            }),
            tx: RefCell::new(tx),
        }
    }
}

impl<E, R, W> Transport for H4Transport<R, W>
where
    E: core::fmt::Debug,
    R: embedded_io_async::Read<Error = E>,
    W: embedded_io::Write<Error = E>,
{
    type Error = H4Error<E>;

    fn write_frame(&self, frame: &[u8]) -> Result<(), Self::Error> {
        let mut tx = self.tx.borrow_mut();
        tx.write_all(&[H4_COMMAND]).map_err(H4Error::Io)?;
        tx.write_all(frame).map_err(H4Error::Io)?;
        tx.flush().map_err(H4Error::Io)
    }

    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.rx.borrow_mut();
        let RxState {
            rx,
            frame,
            filled,
            indicator_seen,
        } = &mut *state;

        if !*indicator_seen {
            let mut indicator = [0u8; 1];
            if rx.read(&mut indicator).await.map_err(H4Error::Io)? == 0 {
                return Err(H4Error::UnexpectedEof);
            }
            if indicator[0] != H4_EVENT {
                return Err(H4Error::UnexpectedIndicator(indicator[0]));
            }
            *indicator_seen = true;
        }

        while *filled < 2 {
            let n = rx.read(&mut frame[*filled..2]).await.map_err(H4Error::Io)?;
            if n == 0 {
                return Err(H4Error::UnexpectedEof);
            }
            *filled += n;
        }

        let total = 2 + usize::from(frame[1]);
        while *filled < total {
            let n = rx.read(&mut frame[*filled..total]).await.map_err(H4Error::Io)?;
            if n == 0 {
                return Err(H4Error::UnexpectedEof);
            }
            *filled += n;
        }

        // Frame fully consumed; the stream stays aligned even on the error
        // path below.
        *indicator_seen = false;
        *filled = 0;
        if total > buf.len() {
            return Err(H4Error::FrameTooLong(total));
        }
        buf[..total].copy_from_slice(&frame[..total]);
        Ok(total)
    }
}
