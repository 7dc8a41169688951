use std::io::{Read, Write};
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use reactor_buf::{DrainOutcome, RecvBuffer, SendList};

use crate::error::{ReactorError, Result};

enum Socket {
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

/// A non-blocking socket paired with the byte containers used to move data
/// through it. Owned exclusively by its channel reference's shared info;
/// never touched from more than one thread at a time.
pub struct Channel {
    socket: Socket,
    pub recv: RecvBuffer,
    pub send: SendList,
    uuid: Uuid,
}

impl Channel {
    pub fn new(max_recv_buffer_len: usize, max_send_list_count: usize) -> Self {
        Self {
            socket: Socket::None,
            recv: RecvBuffer::with_capacity(max_recv_buffer_len),
            send: SendList::with_capacity(max_send_list_count),
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn recv_capacity(&self) -> usize {
        self.recv.capacity()
    }

    pub fn send_capacity(&self) -> usize {
        self.send.max_chunks()
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)?;
        self.socket = Socket::Stream(stream);
        Ok(())
    }

    /// Binds with the requested kernel backlog, which `mio::net::TcpListener
    /// ::bind` has no way to express on its own.
    pub fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<()> {
        let domain = match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;
        let listener = TcpListener::from_std(socket.into());
        self.socket = Socket::Listener(listener);
        Ok(())
    }

    pub fn accept(&mut self) -> Result<(Channel, SocketAddr)> {
        let Socket::Listener(listener) = &self.socket else {
            return Err(ReactorError::ChannelNotConnect);
        };
        let (stream, addr) = listener.accept()?;
        let mut client = Channel::new(self.recv_capacity(), self.send_capacity());
        client.socket = Socket::Stream(stream);
        Ok((client, addr))
    }

    pub fn as_stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.socket {
            Socket::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_source_mut(&mut self) -> Option<&mut dyn mio::event::Source> {
        match &mut self.socket {
            Socket::Stream(s) => Some(s),
            Socket::Listener(l) => Some(l),
            Socket::None => None,
        }
    }

    pub fn as_listener(&self) -> Option<&TcpListener> {
        match &self.socket {
            Socket::Listener(l) => Some(l),
            _ => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            Socket::Stream(s) => s.peer_addr().ok(),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            Socket::Stream(s) => s.local_addr().ok(),
            Socket::Listener(l) => l.local_addr().ok(),
            Socket::None => None,
        }
    }

    pub fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        match &self.socket {
            Socket::Stream(s) => Some(s.as_raw_fd()),
            Socket::Listener(l) => Some(l.as_raw_fd()),
            Socket::None => None,
        }
    }

    /// Connect completion check: a writable non-blocking stream with no
    /// pending `SO_ERROR` has finished its handshake.
    pub fn take_connect_result(&self) -> Result<()> {
        match &self.socket {
            Socket::Stream(s) => match s.take_error()? {
                Some(e) => Err(ReactorError::Io(e)),
                None => Ok(()),
            },
            _ => Err(ReactorError::ChannelNotConnect),
        }
    }

    /// Reads as much as fits into the receive buffer. Returns the number of
    /// bytes read; `RecvBufferFull` if the buffer was already saturated and
    /// the peer still had data, `RecvFail` on a real I/O error other than
    /// `WouldBlock`.
    pub fn fill_recv(&mut self) -> Result<usize> {
        let stream = match &mut self.socket {
            Socket::Stream(s) => s,
            _ => return Err(ReactorError::NotConnected),
        };
        let mut scratch = [0u8; 4096];
        let mut total = 0;
        loop {
            if self.recv.is_full() {
                return Err(ReactorError::RecvBufferFull);
            }
            match stream.read(&mut scratch) {
                Ok(0) => return Err(ReactorError::RecvFail),
                Ok(n) => {
                    total += self.recv.push(&scratch[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ReactorError::Io(e)),
            }
        }
        Ok(total)
    }

    /// Drains the send list into the socket. Returns the number of bytes
    /// written and whether the list is now empty (`true`) or interest in
    /// writability should stay armed (`false`).
    pub fn drain_send(&mut self) -> Result<(usize, bool)> {
        let stream = match &mut self.socket {
            Socket::Stream(s) => s,
            _ => return Err(ReactorError::NotConnected),
        };
        let mut written = 0;
        let outcome = self.send.drain_with(|chunk| match stream.write(chunk) {
            Ok(n) => {
                written += n;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        });
        match outcome {
            Ok(DrainOutcome::Complete) => Ok((written, true)),
            Ok(DrainOutcome::Partial) => Ok((written, false)),
            Err(e) => Err(ReactorError::Io(e)),
        }
    }
}
