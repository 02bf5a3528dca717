//! CLI subcommands.

use anyhow::{bail, Context};
use clap::Subcommand;
use crossbeam::channel::{self, Sender};
use msgr_core::{
    AuthVerdict, Authorizer, ConnectionRef, Dispatched, Dispatcher, EntityName, EntityType,
    FeatureSet, Message, MessengerBuilder, MessengerConfig,
};
use msgr_loopback::{LoopbackNetwork, LoopbackTransport};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MSG_PING: u16 = 0x0001;
const MSG_PONG: u16 = 0x0002;
const AUTH_SHARED_SECRET: u32 = 1;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange pings and pongs between two loopback messengers
    PingPong {
        /// Number of round trips
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,

        /// Ping payload size in bytes
        #[arg(long, default_value_t = 64)]
        payload: usize,

        /// Client default send priority (overrides the config file)
        #[arg(long)]
        priority: Option<i32>,

        /// Shared secret both sides authenticate with
        #[arg(long, default_value = "loopback")]
        secret: String,

        /// Per-round-trip timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Show the policy the configuration resolves for a peer type
    Policy {
        /// Peer entity type (mon, mds, osd, client, auth)
        peer: EntityType,
    },

    /// Decode a feature mask, hex (0x..) or decimal
    Features {
        /// Defaults to the baseline every policy advertises
        mask: Option<String>,
    },
}

impl Command {
    pub fn execute(&self, config: &MessengerConfig) -> anyhow::Result<CommandResult> {
        match self {
            Command::PingPong {
                count,
                payload,
                priority,
                secret,
                timeout_ms,
            } => ping_pong(
                config,
                *count,
                *payload,
                *priority,
                secret,
                Duration::from_millis(*timeout_ms),
            ),
            Command::Policy { peer } => Ok(show_policy(config, *peer)),
            Command::Features { mask } => {
                let mask = match mask {
                    Some(text) => parse_mask(text)?,
                    None => FeatureSet::SUPPORTED_DEFAULT,
                };
                Ok(show_features(mask))
            }
        }
    }
}

/// Titled list of name/value pairs printed by every command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub title: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl CommandResult {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
        }
    }

    fn field(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        for field in &self.fields {
            writeln!(f, "  {:<20} {}", field.name, field.value)?;
        }
        Ok(())
    }
}

// ---- ping-pong ------------------------------------------------------------

struct SharedSecret(Vec<u8>);

impl SharedSecret {
    fn issue(&self) -> Option<Authorizer> {
        Some(Authorizer::new(AUTH_SHARED_SECRET, self.0.clone()))
    }

    fn verify(&self, protocol: u32, authorizer: &[u8]) -> Option<AuthVerdict> {
        if protocol != AUTH_SHARED_SECRET {
            return None;
        }
        Some(if authorizer == self.0.as_slice() {
            AuthVerdict::accept(Vec::<u8>::new())
        } else {
            AuthVerdict::reject()
        })
    }
}

/// Server side: hands pings to the driving thread for a reply.
struct Ponger {
    secret: SharedSecret,
    pings: Sender<(ConnectionRef, Message)>,
}

impl Dispatcher for Ponger {
    fn name(&self) -> &str {
        "ponger"
    }

    fn on_dispatch(&self, msg: Message) -> Dispatched {
        if msg.msg_type() != MSG_PING {
            return Dispatched::Declined(msg);
        }
        let Some(con) = msg.connection().cloned() else {
            return Dispatched::Declined(msg);
        };
        let _ = self.pings.send((con, msg));
        Dispatched::Claimed
    }

    fn on_connect(&self, con: &ConnectionRef) {
        debug!(peer = %con.peer_addr(), "ponger connected");
    }

    fn issue_authorizer(&self, _peer_type: EntityType, _force_new: bool) -> Option<Authorizer> {
        self.secret.issue()
    }

    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        protocol: u32,
        authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        self.secret.verify(protocol, authorizer)
    }
}

/// Client side: counts pongs.
struct Pinger {
    secret: SharedSecret,
    pongs: Mutex<u32>,
    cond: Condvar,
}

impl Pinger {
    fn wait_for(&self, n: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pongs = self.pongs.lock();
        while *pongs < n {
            if self.cond.wait_until(&mut pongs, deadline).timed_out() {
                break;
            }
        }
        *pongs >= n
    }
}

impl Dispatcher for Pinger {
    fn name(&self) -> &str {
        "pinger"
    }

    fn on_dispatch(&self, msg: Message) -> Dispatched {
        if msg.msg_type() != MSG_PONG {
            return Dispatched::Declined(msg);
        }
        *self.pongs.lock() += 1;
        self.cond.notify_all();
        Dispatched::Claimed
    }

    fn issue_authorizer(&self, _peer_type: EntityType, _force_new: bool) -> Option<Authorizer> {
        self.secret.issue()
    }

    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        protocol: u32,
        authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        self.secret.verify(protocol, authorizer)
    }
}

fn ping_pong(
    config: &MessengerConfig,
    count: u32,
    payload: usize,
    priority: Option<i32>,
    secret: &str,
    timeout: Duration,
) -> anyhow::Result<CommandResult> {
    let network = LoopbackNetwork::new();
    let policies = config.policy_set();

    let server = MessengerBuilder::from_config(EntityName::osd(0), config)
        .build(|handle| LoopbackTransport::bind(&network, handle, policies.clone()))?;
    let (pings_tx, pings) = channel::unbounded();
    server.add_dispatcher_tail(Arc::new(Ponger {
        secret: SharedSecret(secret.as_bytes().to_vec()),
        pings: pings_tx,
    }));

    let client = MessengerBuilder::from_config(EntityName::client(1), config)
        .build(|handle| LoopbackTransport::bind(&network, handle, policies))?;
    if let Some(priority) = priority {
        client.set_default_send_priority(priority);
    }
    let pinger = Arc::new(Pinger {
        secret: SharedSecret(secret.as_bytes().to_vec()),
        pongs: Mutex::new(0),
        cond: Condvar::new(),
    });
    client.add_dispatcher_tail(pinger.clone());

    server.start()?;
    client.start()?;
    info!(client = %client.myinst(), server = %server.myinst(), count, "starting ping-pong");

    let mut rtts = Vec::with_capacity(count as usize);
    let started = Instant::now();
    for i in 1..=count {
        let sent = Instant::now();
        client.send_message(Message::new(MSG_PING, vec![0u8; payload]), &server.myinst())?;
        let (con, ping) = pings
            .recv_timeout(timeout)
            .with_context(|| format!("no ping {} within {:?}", i, timeout))?;
        server.send_message_on(Message::new(MSG_PONG, ping.into_payload()), &con)?;
        if !pinger.wait_for(i, timeout) {
            bail!("no pong {} within {:?}", i, timeout);
        }
        rtts.push(sent.elapsed());
    }
    let total = started.elapsed();

    let features = client.get_connection(&server.myinst())?.features();
    let result = CommandResult::new("ping-pong")
        .field("client", client.myinst())
        .field("server", server.myinst())
        .field("round_trips", rtts.len())
        .field("payload_bytes", payload)
        .field("priority", client.default_send_priority())
        .field("features", features)
        .field("rtt_min_us", micros(rtts.iter().min()))
        .field("rtt_max_us", micros(rtts.iter().max()))
        .field("rtt_avg_us", avg_micros(&rtts))
        .field("total_ms", total.as_millis());

    client.shutdown()?;
    server.shutdown()?;
    client.wait();
    server.wait();
    Ok(result)
}

fn micros(d: Option<&Duration>) -> u128 {
    d.map_or(0, |d| d.as_micros())
}

fn avg_micros(rtts: &[Duration]) -> u128 {
    if rtts.is_empty() {
        return 0;
    }
    rtts.iter().map(|d| d.as_micros()).sum::<u128>() / rtts.len() as u128
}

// ---- inspection -----------------------------------------------------------

fn show_policy(config: &MessengerConfig, peer: EntityType) -> CommandResult {
    let policies = config.policy_set();
    let policy = policies.policy_for(peer);
    let throttle = policy
        .throttler
        .as_ref()
        .map_or_else(|| "none".to_string(), |t| format!("{} ({} bytes)", t.name(), t.max()));
    CommandResult::new(format!("policy for {} peers", peer))
        .field("lossy", policy.lossy)
        .field("server", policy.server)
        .field("features_supported", policy.features_supported)
        .field("features_required", policy.features_required)
        .field("throttle", throttle)
}

fn show_features(mask: FeatureSet) -> CommandResult {
    let unknown = FeatureSet(mask.bits() & !FeatureSet::SUPPORTED_DEFAULT.bits());
    CommandResult::new("features")
        .field("mask", mask)
        .field("names", mask.names().join(","))
        .field("unknown", unknown)
}

fn parse_mask(text: &str) -> anyhow::Result<FeatureSet> {
    let bits = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    }
    .with_context(|| format!("invalid feature mask {:?}", text))?;
    Ok(FeatureSet(bits))
}
