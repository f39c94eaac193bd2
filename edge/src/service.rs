use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use comms::{
    Deserialize, OnoReceiver, OnoSender,
    msg::{Command, Msg},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::Semaphore,
    task::JoinSet,
    time,
};

use crate::{
    error::{EdgeErr, Result},
    lifecycle::LifecycleController,
    runner::JobRunner,
};

const STARTING_RX_BUF_SIZE: usize = 1028;

/// A frame whose body may not decode into a `Msg`.
///
/// The frame boundary is intact either way, so a bad body is answered and the
/// connection keeps going, while framing or transport errors end it.
struct Request<'a>(io::Result<Msg<'a>>);

impl<'a> Deserialize<'a> for Request<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        Ok(Self(Msg::deserialize(buf)))
    }
}

/// The inbound command surface of an edge node.
pub struct CommandService {
    lifecycle: Arc<LifecycleController>,
    runner: JobRunner,
}

impl CommandService {
    pub fn new(lifecycle: Arc<LifecycleController>, runner: JobRunner) -> Self {
        Self { lifecycle, runner }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// Applies one operator command. Never waits on training.
    ///
    /// # Errors
    /// Returns the reason the command was refused, to be sent back to the caller.
    pub fn handle(&self, cmd: Command) -> Result<()> {
        match cmd {
            Command::TrainInit => {
                if self.lifecycle.is_shutting_down() {
                    return Err(EdgeErr::ShuttingDown);
                }

                info!("train init");
                Ok(())
            }
            Command::LocalTrain(spec) => {
                let job = self.lifecycle.admit(spec)?;
                let id = job.id();

                match self.runner.submit(job) {
                    Ok(handle) => {
                        self.lifecycle.supervise(handle);
                        Ok(())
                    }
                    Err(e) => {
                        self.lifecycle.discard(id);
                        Err(e)
                    }
                }
            }
            Command::TrainInterrupt => {
                match self.lifecycle.interrupt() {
                    Some(id) => info!(job_id = id; "interrupt requested"),
                    None => debug!("interrupt requested with no running job"),
                }

                Ok(())
            }
            Command::TrainFinish => {
                if !self.lifecycle.signal_shutdown() {
                    debug!("train finish received again");
                }

                Ok(())
            }
            Command::LocalTrainFinish(_) | Command::Ack | Command::Disconnect => {
                Err(EdgeErr::InvalidRequest("not an edge node command"))
            }
        }
    }

    /// Serves requests from one peer until it disconnects.
    ///
    /// Shutdown does not end the connection: later commands are still answered,
    /// with `EdgeErr::ShuttingDown` where they would start new work.
    ///
    /// # Args
    /// * `rx` - Receiving end of the peer's channel.
    /// * `tx` - Sending end of the peer's channel.
    pub async fn serve_connection<R, W>(
        &self,
        mut rx: OnoReceiver<R>,
        mut tx: OnoSender<W>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut rx_buf = Vec::with_capacity(STARTING_RX_BUF_SIZE);

        loop {
            let Request(msg) = match rx.recv_into(&mut rx_buf).await {
                Ok(request) => request,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            let cmd = match msg {
                Ok(Msg::Control(Command::Disconnect)) => break,
                Ok(Msg::Control(cmd)) => cmd,
                Ok(Msg::Err(detail)) => {
                    warn!("peer sent an error: {detail}");
                    continue;
                }
                Err(e) => {
                    warn!("refused malformed request: {e}");
                    tx.send(&Msg::Err(format!("malformed request: {e}").into()))
                        .await?;
                    continue;
                }
            };

            let kind = cmd.kind();
            debug!("received {kind}");

            match self.handle(cmd) {
                Ok(()) => tx.send(&Msg::Control(Command::Ack)).await?,
                Err(e) => {
                    warn!("refused {kind}: {e}");
                    tx.send(&Msg::Err(e.to_string().into())).await?;
                }
            }
        }

        Ok(())
    }
}

/// Accepts operator connections until shutdown is signaled.
///
/// At most `max_connections` peers are served at once. Once shutdown fires no
/// new peer is accepted, open connections get up to `drain_grace` to disconnect
/// and whatever is left after that is closed.
pub async fn serve(
    listener: TcpListener,
    service: Arc<CommandService>,
    max_connections: usize,
    drain_grace: Duration,
) -> io::Result<()> {
    let shutdown = service.lifecycle().shutdown_token();
    let permits = Arc::new(Semaphore::new(max_connections));
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => permit.map_err(io::Error::other)?,
        };

        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            },
        };

        debug!("operator connected from {addr}");
        let service = Arc::clone(&service);

        tasks.spawn(async move {
            let _permit = permit;
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            (addr, service.serve_connection(rx, tx).await)
        });

        while let Some(joined) = tasks.try_join_next() {
            log_connection_end(joined);
        }
    }

    drop(listener);
    info!("stopped accepting connections, draining {} open", tasks.len());

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            log_connection_end(joined);
        }
    };

    if time::timeout(drain_grace, drain).await.is_err() {
        warn!(
            "closing {} connections still open after {drain_grace:?}",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    Ok(())
}

fn log_connection_end(
    joined: std::result::Result<(SocketAddr, io::Result<()>), tokio::task::JoinError>,
) {
    match joined {
        Ok((addr, Ok(()))) => debug!("connection from {addr} closed"),
        Ok((addr, Err(e))) => warn!("connection from {addr} failed: {e}"),
        Err(e) => warn!("connection task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use comms::specs::edge::{LocalTrainSpec, ModelRef};

    use super::*;
    use crate::{
        data::{DataSource, Dataset},
        job::TrainingJob,
        reporter::Reporter,
        training::{Metrics, TrainRequest, Trainer, TrainingError},
    };
    use tokio_util::sync::CancellationToken;

    struct Noop;

    impl Trainer for Noop {
        fn train(
            &self,
            _: &Dataset,
            _: &TrainRequest,
            _: &CancellationToken,
        ) -> std::result::Result<Metrics, TrainingError> {
            Ok(Metrics::new())
        }
    }

    struct Single;

    impl DataSource for Single {
        fn dataset(&self) -> std::result::Result<Dataset, TrainingError> {
            Ok(Dataset::new(vec![0]))
        }
    }

    struct Quiet;

    #[async_trait::async_trait]
    impl Reporter for Quiet {
        async fn report(&self, _: &TrainingJob) {}
    }

    fn service() -> CommandService {
        let lifecycle = Arc::new(LifecycleController::new());
        let runner = JobRunner::new(
            lifecycle.state(),
            Arc::new(Noop),
            Arc::new(Single),
            Arc::new(Quiet),
        );
        CommandService::new(lifecycle, runner)
    }

    #[tokio::test]
    async fn init_and_interrupt_are_acknowledged_when_idle() {
        let service = service();
        service.handle(Command::TrainInit).unwrap();
        service.handle(Command::TrainInterrupt).unwrap();
    }

    #[tokio::test]
    async fn invalid_epochs_are_refused_synchronously() {
        let service = service();
        let spec = LocalTrainSpec {
            base_model: ModelRef::new("base"),
            local_model: ModelRef::new("local"),
            epochs: 0,
        };

        let err = service.handle(Command::LocalTrain(spec)).unwrap_err();
        assert!(matches!(err, EdgeErr::InvalidRequest(_)));
        assert!(service.lifecycle().current_job().is_none());
    }

    #[tokio::test]
    async fn operator_side_commands_are_refused() {
        let service = service();
        assert!(service.handle(Command::Ack).is_err());
    }

    #[tokio::test]
    async fn connection_keeps_answering_after_finish() {
        let service = service();
        let (near, far) = tokio::io::duplex(1024);

        let (rx, tx) = tokio::io::split(far);
        let (rx, tx) = comms::channel(rx, tx);
        let serving = service.serve_connection(rx, tx);

        let (rx, tx) = tokio::io::split(near);
        let (rx, tx) = comms::channel(rx, tx);
        let mut client = crate::client::RpcClient::new(rx, tx);

        let calling = async {
            client.train_finish().await.unwrap();
            client.train_finish().await.unwrap();
            assert!(matches!(
                client.train_init().await,
                Err(EdgeErr::Rejected(_))
            ));
            client.train_interrupt().await.unwrap();
            client.close().await.unwrap();
        };

        let (served, ()) = tokio::join!(serving, calling);
        served.unwrap();
    }

    #[tokio::test]
    async fn init_after_finish_is_refused() {
        let service = service();
        service.handle(Command::TrainFinish).unwrap();
        service.handle(Command::TrainFinish).unwrap();

        assert!(matches!(
            service.handle(Command::TrainInit),
            Err(EdgeErr::ShuttingDown)
        ));
    }
}
