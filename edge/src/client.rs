use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
    specs::edge::{LocalTrainResult, LocalTrainSpec},
};
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::error::{EdgeErr, Result};

const STARTING_RX_BUF_SIZE: usize = 256;

/// Request/reply client for the control protocol.
///
/// Every request is a `Msg::Control` answered by either `Ack` or `Msg::Err`.
/// The operator uses it to drive edge nodes and edge nodes use it to report
/// `LocalTrainFinish` back to the operator.
pub struct RpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
    rx_buf: Vec<u8>,
}

impl RpcClient<OwnedReadHalf, OwnedWriteHalf> {
    /// Opens a TCP connection to `addr`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Ok(Self::new(rx, tx))
    }
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(rx: OnoReceiver<R>, tx: OnoSender<W>) -> Self {
        Self {
            rx,
            tx,
            rx_buf: Vec::with_capacity(STARTING_RX_BUF_SIZE),
        }
    }

    /// Sends `cmd` and waits for its reply.
    ///
    /// # Errors
    /// `EdgeErr::Rejected` with the peer's reason when it answers `Msg::Err`,
    /// `EdgeErr::UnexpectedReply` for anything but `Ack` and `EdgeErr::Io` on transport failures.
    pub async fn call(&mut self, cmd: Command) -> Result<()> {
        let kind = cmd.kind();
        self.tx.send(&Msg::Control(cmd)).await?;

        match self.rx.recv_into(&mut self.rx_buf).await? {
            Msg::Control(Command::Ack) => {
                debug!("{kind} acknowledged");
                Ok(())
            }
            Msg::Err(reason) => Err(EdgeErr::Rejected(reason.into_owned())),
            Msg::Control(other) => Err(EdgeErr::UnexpectedReply(other.kind())),
        }
    }

    pub async fn train_init(&mut self) -> Result<()> {
        self.call(Command::TrainInit).await
    }

    pub async fn local_train(&mut self, spec: LocalTrainSpec) -> Result<()> {
        self.call(Command::LocalTrain(spec)).await
    }

    pub async fn train_interrupt(&mut self) -> Result<()> {
        self.call(Command::TrainInterrupt).await
    }

    pub async fn train_finish(&mut self) -> Result<()> {
        self.call(Command::TrainFinish).await
    }

    pub async fn local_train_finish(&mut self, result: LocalTrainResult) -> Result<()> {
        self.call(Command::LocalTrainFinish(result)).await
    }

    /// Tells the peer this connection is done and closes the write half.
    pub async fn close(mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Disconnect)).await?;
        self.tx.shutdown().await?;
        Ok(())
    }
}
