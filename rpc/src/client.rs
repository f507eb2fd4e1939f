// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::Duration;

use serde_with::DurationMilliSeconds;

use crate::{
    Error, Event, FailureCode, NodeInfo, Request, RpcMsg, Subscription, SubscriptionFeed, Topic,
    LN_NODE_PUB_ENDPOINT, LN_NODE_RPC_ENDPOINT,
};

/// Interval at which subscription workers check whether they were closed
const POLL_INTERVAL_MS: i64 = 100;

/// Request/reply and notification access to a lightning node. Implemented by the ZMQ
/// [`Client`]; alternative transports (like in-process test nodes) implement it too.
pub trait Transport: Send + Sync {
    /// Performs a single request. `timeout` overrides the default per-call timeout.
    fn call(&self, request: RpcMsg, timeout: Option<Duration>) -> Result<RpcMsg, Error>;

    /// Opens a notification stream. Current state of the topic is delivered first.
    fn subscribe(&self, topic: Topic) -> Result<Subscription, Error>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn call(&self, request: RpcMsg, timeout: Option<Duration>) -> Result<RpcMsg, Error> {
        self.as_ref().call(request, timeout)
    }

    fn subscribe(&self, topic: Topic) -> Result<Subscription, Error> {
        self.as_ref().subscribe(topic)
    }
}

/// Connection parameters of the [`Client`]
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(Serialize, Deserialize)]
#[serde(crate = "serde_crate")]
pub struct ClientConfig {
    /// ZMQ endpoint of the node REP socket
    pub rpc_endpoint: String,

    /// ZMQ endpoint of the node PUB socket
    pub pub_endpoint: String,

    /// Hex-encoded credentials sent with each request
    pub macaroon: String,

    /// Default per-call timeout
    #[serde_as(as = "DurationMilliSeconds")]
    pub timeout: Duration,

    /// Delay before a subscription reconnects after losing its socket
    #[serde_as(as = "DurationMilliSeconds")]
    pub restart_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            rpc_endpoint: LN_NODE_RPC_ENDPOINT.to_owned(),
            pub_endpoint: LN_NODE_PUB_ENDPOINT.to_owned(),
            macaroon: empty!(),
            timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(1),
        }
    }
}

struct Inner {
    ctx: zmq::Context,
    config: ClientConfig,
    /// REQ sockets not used by any call right now
    idle: Mutex<Vec<zmq::Socket>>,
}

impl Inner {
    /// Takes an idle REQ socket or opens a new one, so calls in flight never share a socket
    fn checkout(&self) -> Result<zmq::Socket, Error> {
        let idle = self.idle.lock().map_err(|_| Error::Poisoned)?.pop();
        match idle {
            Some(socket) => Ok(socket),
            None => {
                trace!("Opening new RPC socket to {}", self.config.rpc_endpoint);
                self.req_socket()
            }
        }
    }

    fn checkin(&self, socket: zmq::Socket) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(socket);
        }
    }

    fn req_socket(&self) -> Result<zmq::Socket, Error> {
        let socket = self.ctx.socket(zmq::REQ)?;
        socket.set_linger(0)?;
        socket.connect(&self.config.rpc_endpoint)?;
        Ok(socket)
    }

    fn sub_socket(&self, topic: &Topic) -> Result<zmq::Socket, Error> {
        let socket = self.ctx.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        socket.connect(&self.config.pub_endpoint)?;
        socket.set_subscribe(topic.filter().as_bytes())?;
        Ok(socket)
    }
}

/// ZMQ client of the node API. Cheap to clone; clones share a pool of request sockets, so the
/// client may be used from several threads at once without calls waiting on each other.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    node_info: NodeInfo,
}

impl Client {
    /// Connects to the node and checks the credentials with an authenticated `get_info` call
    pub fn connect(config: &ClientConfig) -> Result<Self, Error> {
        debug!("RPC socket {}", config.rpc_endpoint);

        debug!("Setting up RPC client...");
        let inner = Arc::new(Inner {
            ctx: zmq::Context::new(),
            config: config.clone(),
            idle: Mutex::new(empty!()),
        });

        let node_info = match Client::request(&inner, RpcMsg::GetInfo, None)? {
            RpcMsg::NodeInfo(info) => info,
            other => return Err(Error::UnexpectedReply(other.method())),
        };
        info!(
            "Connected to node {} at block height {}",
            node_info.public_key, node_info.current_block_height
        );

        Ok(Client { inner, node_info })
    }

    /// Node information obtained while connecting
    #[inline]
    pub fn node_info(&self) -> &NodeInfo { &self.node_info }

    #[inline]
    pub fn config(&self) -> &ClientConfig { &self.inner.config }

    fn request(inner: &Inner, call: RpcMsg, timeout: Option<Duration>) -> Result<RpcMsg, Error> {
        let timeout = timeout.unwrap_or(inner.config.timeout);
        debug!("Executing {}", call);
        let request = Request { macaroon: inner.config.macaroon.clone(), call };
        let data = serde_json::to_vec(&request)?;

        let socket = inner.checkout()?;
        socket.set_rcvtimeo(timeout.as_millis().min(i32::MAX as u128) as i32)?;
        let reply = socket.send(data, 0).and_then(|_| socket.recv_bytes(0));
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                // REQ socket is stuck in the "awaiting reply" state and is not returned
                drop(socket);
                return Err(match err {
                    zmq::Error::EAGAIN => {
                        warn!("Request {} timed out after {:?}", request.call.method(), timeout);
                        Error::Timeout(timeout)
                    }
                    err => err.into(),
                });
            }
        };
        inner.checkin(socket);

        let reply: RpcMsg = serde_json::from_slice(&reply)?;
        trace!("Got reply {}", reply);
        match reply {
            RpcMsg::Failure(failure) if failure.code == FailureCode::Unauthorized => {
                Err(Error::Unauthorized)
            }
            RpcMsg::Failure(failure) => Err(failure.into()),
            reply => Ok(reply),
        }
    }
}

impl Transport for Client {
    fn call(&self, request: RpcMsg, timeout: Option<Duration>) -> Result<RpcMsg, Error> {
        Client::request(&self.inner, request, timeout)
    }

    fn subscribe(&self, topic: Topic) -> Result<Subscription, Error> {
        let (subscription, feed) = Subscription::channel(topic.clone());
        let client = self.clone();
        let worker = thread::Builder::new()
            .name(format!("sub:{}", topic))
            .spawn(move || client.run_subscriber(topic, feed))?;
        Ok(subscription.with_worker(worker))
    }
}

impl Client {
    /// Subscription worker loop: (re)connects the SUB socket, delivers the topic snapshot and
    /// forwards live events until the subscription is closed.
    fn run_subscriber(self, topic: Topic, mut feed: SubscriptionFeed) {
        let restart_delay = self.inner.config.restart_delay;
        'connect: while !feed.is_closed() {
            let socket = match self.inner.sub_socket(&topic) {
                Ok(socket) => socket,
                Err(err) => {
                    warn!("Unable to subscribe to {}: {}", topic, err);
                    sleep(restart_delay);
                    continue;
                }
            };
            debug!("Subscribed to {} at {}", topic, self.inner.config.pub_endpoint);

            // Snapshot goes after the subscription, so no update falls in between
            if let Some(request) = topic.snapshot_request() {
                match self.call(request, None) {
                    Ok(reply) => {
                        for event in topic.snapshot_events(reply) {
                            if !feed.publish(event) {
                                return;
                            }
                        }
                    }
                    Err(Error::Failure(failure)) if failure.code == FailureCode::NotFound => {}
                    Err(err) if err.is_retryable() => {
                        warn!("Snapshot of {} has failed: {}", topic, err);
                        sleep(restart_delay);
                        continue;
                    }
                    Err(err) => {
                        error!("Subscription to {} is terminated: {}", topic, err);
                        feed.fail(err.to_failure());
                        return;
                    }
                }
            }

            loop {
                if feed.is_closed() {
                    return;
                }
                let ready = {
                    let mut items = [socket.as_poll_item(zmq::POLLIN)];
                    zmq::poll(&mut items, POLL_INTERVAL_MS)
                };
                match ready {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Subscription socket for {} has failed: {}", topic, err);
                        sleep(restart_delay);
                        continue 'connect;
                    }
                }
                let frames = match socket.recv_multipart(0) {
                    Ok(frames) => frames,
                    Err(err) => {
                        warn!("Subscription socket for {} has failed: {}", topic, err);
                        sleep(restart_delay);
                        continue 'connect;
                    }
                };
                let event = match frames.as_slice() {
                    [_, payload] => serde_json::from_slice::<Event>(payload),
                    _ => {
                        warn!("Ignoring notification with {} frames", frames.len());
                        continue;
                    }
                };
                match event {
                    Ok(event) if topic.matches(&event.payload) => {
                        trace!("Got notification {}", event);
                        if !feed.publish(event) {
                            return;
                        }
                    }
                    Ok(event) => trace!("Ignoring notification {} not matching {}", event, topic),
                    Err(err) => warn!("Ignoring malformed notification: {}", err),
                }
            }
        }
    }
}
