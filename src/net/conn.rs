use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Control messages are tiny; the largest reply read here is ten bytes.
pub const CONTROL_BUFFER_SIZE: usize = 512;

/// TCP control stream with a read-ahead buffer and a per-operation I/O bound.
pub struct BufferedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buffer: Vec<u8>,
    temp_buffer: Vec<u8>,
    io_timeout: Duration,
}

fn timed_out(what: &str, limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} did not complete within {:?}", what, limit),
    )
}

impl BufferedConnection {
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connect", connect_timeout))??;
        stream.set_nodelay(true)?;
        Self::new(stream, CONTROL_BUFFER_SIZE, io_timeout)
    }

    pub fn new(stream: TcpStream, buffer_size: usize, io_timeout: Duration) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(BufferedConnection {
            stream,
            peer,
            read_buffer: Vec::with_capacity(buffer_size),
            temp_buffer: vec![0u8; buffer_size],
            io_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read(&mut self) -> io::Result<usize> {
        let n = timeout(self.io_timeout, self.stream.read(&mut self.temp_buffer))
            .await
            .map_err(|_| timed_out("read", self.io_timeout))??;
        if n > 0 {
            self.read_buffer.extend_from_slice(&self.temp_buffer[..n]);
        }
        Ok(n)
    }

    fn read_from_buffer(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.read_buffer.len() >= len {
            Some(self.read_buffer.drain(..len).collect())
        } else {
            None
        }
    }

    pub async fn ensure_bytes(&mut self, n: usize) -> io::Result<()> {
        while self.read_buffer.len() < n {
            if self.read().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "connection closed after {} of {} bytes",
                        self.read_buffer.len(),
                        n
                    ),
                ));
            }
        }
        Ok(())
    }

    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.ensure_bytes(n).await?;
        self.read_from_buffer(n)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "Buffer underflow"))
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        timeout(self.io_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| timed_out("write", self.io_timeout))?
    }

    /// Sends FIN so the proxy tears the association down promptly.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        timeout(self.io_timeout, self.stream.shutdown())
            .await
            .map_err(|_| timed_out("shutdown", self.io_timeout))?
    }

    #[cfg(test)]
    fn buffer_len(&self) -> usize {
        self.read_buffer.len()
    }
}
