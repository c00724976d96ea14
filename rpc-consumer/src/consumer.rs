// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Consumes remote calls from the driver's topic

use crate::bus::BusError;
use crate::bus::Connection;
use crate::bus::IncomingCall;
use crate::bus::Target;
use crate::bus::Transport;
use crate::config::RpcConfig;
use crate::driver::LbaasDriver;
use crate::endpoint::EndpointRegistry;
use crate::endpoint::RegistryError;
use crate::topic::Topic;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect to message bus at {url}")]
    Connect {
        url: String,
        #[source]
        err: BusError,
    },

    #[error("Failed to consume from topic {topic}")]
    Consume {
        topic: Topic,
        #[source]
        err: BusError,
    },

    #[error("Failed to close message bus connection")]
    Close(#[source] BusError),

    #[error("Invalid endpoint set")]
    Registry(#[from] RegistryError),

    #[error("worker_count must be at least 1")]
    NoWorkers,

    #[error("Consumer has already been stopped")]
    AlreadyStopped,
}

enum State {
    /// Subscribed, but not yet pulling calls
    Created { calls: mpsc::Receiver<IncomingCall> },
    Running { shutdown: watch::Sender<bool>, dispatcher: JoinHandle<()> },
    Stopped,
}

/// Listens on the driver's topic and dispatches each call to the endpoint
/// that handles its method.
///
/// The bus connection and subscription are set up at construction;
/// [`RpcConsumer::start`] begins pulling calls and
/// [`RpcConsumer::stop`] ends it.  A stopped consumer cannot be restarted.
pub struct RpcConsumer {
    log: Logger,
    topic: Topic,
    target: Target,
    registry: Arc<EndpointRegistry>,
    // Held across `close()` so a stop that is cancelled mid-close leaves
    // the connection for the next stop.
    connection: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    state: Mutex<State>,
    in_flight: TaskTracker,
    workers: Arc<Semaphore>,
    dispatched: Arc<AtomicU64>,
}

impl RpcConsumer {
    /// Subscribes to the driver's topic, serving the driver's endpoints
    pub async fn new(
        log: &Logger,
        config: &RpcConfig,
        driver: &LbaasDriver,
        transport: &dyn Transport,
    ) -> Result<Self, Error> {
        let topic = Topic::new(&config.topic_base, driver.environment());
        let registry = EndpointRegistry::new(driver.endpoints())?;
        Self::with_registry(log, config, topic, registry, transport).await
    }

    pub async fn with_registry(
        log: &Logger,
        config: &RpcConfig,
        topic: Topic,
        registry: EndpointRegistry,
        transport: &dyn Transport,
    ) -> Result<Self, Error> {
        if config.worker_count == 0 {
            return Err(Error::NoWorkers);
        }
        let log = log.new(o!(
            "component" => "RpcConsumer",
            "topic" => topic.to_string(),
        ));
        let target = Target {
            topic: topic.to_string(),
            server: config.host.clone(),
            exchange: config.exchange.clone(),
            fanout: false,
        };

        let mut connection = transport
            .connect(&config.transport_url, &target)
            .await
            .map_err(|err| Error::Connect {
                url: config.transport_url.clone(),
                err,
            })?;
        let calls = match connection.create_consumer(&target).await {
            Ok(calls) => calls,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(
                        log,
                        "failed to close connection";
                        "error" => %close_err,
                    );
                }
                return Err(Error::Consume { topic, err });
            }
        };
        info!(
            log,
            "subscribed";
            "exchange" => &target.exchange,
            "server" => &target.server,
            "endpoints" => ?registry.endpoint_names(),
        );

        Ok(Self {
            log,
            topic,
            target,
            registry: Arc::new(registry),
            connection: tokio::sync::Mutex::new(Some(connection)),
            state: Mutex::new(State::Created { calls }),
            in_flight: TaskTracker::new(),
            workers: Arc::new(Semaphore::new(config.worker_count)),
            dispatched: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Number of calls handed to endpoints since construction or the last
    /// [`RpcConsumer::reset`]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Running { .. })
    }

    /// Begins pulling calls from the bus.
    ///
    /// Must be called from within a tokio runtime.  Starting a consumer that
    /// is already running does nothing.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Created { calls } => {
                let (shutdown, shutdown_rx) = watch::channel(false);
                let dispatcher = tokio::spawn(dispatch_loop(
                    self.log.clone(),
                    self.registry.clone(),
                    calls,
                    shutdown_rx,
                    self.workers.clone(),
                    self.in_flight.clone(),
                    self.dispatched.clone(),
                ));
                *state = State::Running { shutdown, dispatcher };
                info!(self.log, "consumer started");
                Ok(())
            }
            running @ State::Running { .. } => {
                *state = running;
                info!(self.log, "consumer already running");
                Ok(())
            }
            State::Stopped => Err(Error::AlreadyStopped),
        }
    }

    /// Stops pulling calls and closes the bus connection.
    ///
    /// With `graceful`, waits for every call already handed to an endpoint
    /// to finish before closing.  Otherwise those calls are left to finish
    /// on their own.  The connection is closed exactly once, by whichever
    /// stop reaches it first; an earlier stop that was cancelled before
    /// closing it leaves that to the next.
    pub async fn stop(&self, graceful: bool) -> Result<(), Error> {
        let previous =
            std::mem::replace(&mut *self.state.lock().unwrap(), State::Stopped);
        match previous {
            State::Stopped => debug!(self.log, "consumer already stopped"),
            State::Created { calls } => drop(calls),
            State::Running { shutdown, dispatcher } => {
                // Fails only if the dispatcher has already exited.
                let _ = shutdown.send(true);
                if let Err(err) = dispatcher.await {
                    warn!(self.log, "dispatcher failed"; "error" => %err);
                }
            }
        }

        self.in_flight.close();
        if graceful {
            debug!(
                self.log,
                "waiting for in-flight calls";
                "count" => self.in_flight.len(),
            );
            self.in_flight.wait().await;
        }

        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_mut() {
            let closed = conn.close().await;
            *connection = None;
            closed.map_err(Error::Close)?;
            info!(self.log, "consumer stopped"; "graceful" => graceful);
        }
        Ok(())
    }

    /// Clears endpoint state and the dispatch counter, keeping the
    /// subscription
    pub fn reset(&self) {
        info!(self.log, "resetting endpoints");
        self.registry.reset();
        self.dispatched.store(0, Ordering::SeqCst);
    }
}

async fn dispatch_loop(
    log: Logger,
    registry: Arc<EndpointRegistry>,
    mut calls: mpsc::Receiver<IncomingCall>,
    mut shutdown: watch::Receiver<bool>,
    workers: Arc<Semaphore>,
    in_flight: TaskTracker,
    dispatched: Arc<AtomicU64>,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let call = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            call = calls.recv() => match call {
                Some(call) => call,
                None => {
                    info!(log, "message bus closed the subscription");
                    break;
                }
            },
        };

        dispatched.fetch_add(1, Ordering::SeqCst);
        let log = log.clone();
        let registry = registry.clone();
        in_flight.spawn(async move {
            registry.handle(&log, call).await;
            drop(permit);
        });
    }
    debug!(log, "dispatcher exiting");
}
