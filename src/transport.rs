use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// The byte-stream duplex boundary between the engine and the outside world,
/// introduced to facilitate mocking the I/O part away for testing.
///
/// The transport may split or coalesce writes arbitrarily - reassembly is the
/// codec layer's job.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// connection.
    async fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

/// [`Transport`] over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> StreamTransport<S> {
        StreamTransport { stream }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.stream.read(buf).await?)
    }
}

pub type TcpTransport = StreamTransport<TcpStream>;

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs) -> anyhow::Result<TcpTransport> {
        Ok(StreamTransport::new(TcpStream::connect(addr).await?))
    }
}
