//! Full-mesh TCP backend for [`CollectiveTransport`], grounded in the
//! teacher's TCP connect/retry plumbing (`relay.rs`, formerly `tcp.rs`) but
//! reshaped around this core's broadcast/all_gather/group model rather than
//! SecureChannel session establishment.
//!
//! Each peer pair shares exactly one TCP connection, so every frame carries a
//! small header identifying which logical channel it belongs to (the two
//! `all_gather` rounds, or a `(tag, direction)` group). A single background
//! task per connection reads frames off the wire and routes each one to the
//! matching channel, the same way `local_transport.rs` keys its in-process
//! channel pairs — so concurrent per-tensor workers never steal bytes meant
//! for a different tensor or direction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{CollectiveTransport, Direction, Group};

const RENDEZVOUS_RETRIES: u32 = 10;
const RENDEZVOUS_RETRY_DELAY: Duration = Duration::from_millis(200);

const KIND_ALLGATHER_U32: u8 = 0;
const KIND_ALLGATHER_ROWS: u8 = 1;
const KIND_GROUP: u8 = 2;

/// Identifies one logical channel multiplexed over a peer connection: either
/// of the two `all_gather` rounds, or a tensor's `(tag, direction)` group.
type ChannelKey = (u8, u32, u8);

fn direction_byte(direction: Direction) -> u8 {
    match direction {
        Direction::Forward => 0,
        Direction::Backward => 1,
    }
}

fn allgather_u32_key() -> ChannelKey {
    (KIND_ALLGATHER_U32, 0, 0)
}

fn allgather_rows_key() -> ChannelKey {
    (KIND_ALLGATHER_ROWS, 0, 0)
}

fn group_key(tag: u32, direction: Direction) -> ChannelKey {
    (KIND_GROUP, tag, direction_byte(direction))
}

struct ChannelEntry {
    tx: UnboundedSender<Vec<u8>>,
    rx: AsyncMutex<UnboundedReceiver<Vec<u8>>>,
}

/// One peer connection: a writer half guarded for atomic frame writes, and a
/// registry of demultiplexed channels fed by the connection's reader task.
struct PeerConn {
    writer: AsyncMutex<OwnedWriteHalf>,
    channels: StdMutex<HashMap<ChannelKey, Arc<ChannelEntry>>>,
}

impl PeerConn {
    fn channel(&self, key: ChannelKey) -> Arc<ChannelEntry> {
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        Arc::clone(channels.entry(key).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(ChannelEntry {
                tx,
                rx: AsyncMutex::new(rx),
            })
        }))
    }

    async fn send(&self, key: ChannelKey, payload: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_tagged_frame(&mut writer, key, payload).await
    }

    async fn recv(&self, key: ChannelKey) -> Result<Vec<u8>, TransportError> {
        let entry = self.channel(key);
        let mut rx = entry.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Shared rendezvous state: one TCP connection per peer rank, established
/// once at startup and reused (via tagged, demultiplexed frames) for every
/// subsequent `all_gather`/`broadcast`.
pub struct TcpWorld {
    rank: usize,
    world_size: usize,
    peers: HashMap<usize, Arc<PeerConn>>,
}

impl TcpWorld {
    /// Establish a full mesh: rank `i` listens on `addrs[i]` and dials every
    /// lower-ranked peer's listen address, so each unordered pair connects
    /// exactly once (lower rank accepts, higher rank connects).
    pub async fn rendezvous(
        rank: usize,
        addrs: Vec<SocketAddr>,
    ) -> Result<Arc<Self>, TransportError> {
        let world_size = addrs.len();
        let listener = TcpListener::bind(addrs[rank])
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        info!(rank, %local_addr, world_size, "tcp transport: listening");

        let expected_incoming = world_size - 1 - rank;
        let accept = async {
            let mut incoming = HashMap::new();
            for _ in 0..expected_incoming {
                let (mut stream, peer_addr) = listener
                    .accept()
                    .await
                    .map_err(TransportError::Io)?;
                stream.set_nodelay(true).ok();
                let peer_rank = read_u32(&mut stream).await? as usize;
                debug!(rank, peer_rank, %peer_addr, "tcp transport: accepted peer");
                incoming.insert(peer_rank, stream);
            }
            Ok::<_, TransportError>(incoming)
        };

        let connect = async {
            let mut outgoing = HashMap::new();
            for peer_rank in 0..rank {
                let mut stream = connect_with_retry(addrs[peer_rank]).await?;
                write_u32(&mut stream, rank as u32).await?;
                debug!(rank, peer_rank, "tcp transport: connected to peer");
                outgoing.insert(peer_rank, stream);
            }
            Ok::<_, TransportError>(outgoing)
        };

        let (incoming, outgoing) = tokio::try_join!(accept, connect)?;

        let mut peers = HashMap::new();
        for (peer_rank, stream) in incoming.into_iter().chain(outgoing) {
            let (reader, writer) = stream.into_split();
            let conn = Arc::new(PeerConn {
                writer: AsyncMutex::new(writer),
                channels: StdMutex::new(HashMap::new()),
            });
            tokio::spawn(demux_loop(rank, peer_rank, reader, Arc::clone(&conn)));
            peers.insert(peer_rank, conn);
        }

        info!(rank, peers = peers.len(), "tcp transport: mesh established");
        Ok(Arc::new(Self {
            rank,
            world_size,
            peers,
        }))
    }

    pub fn transport(self: &Arc<Self>) -> TcpTransport {
        TcpTransport {
            world: Arc::clone(self),
        }
    }
}

/// Reads tagged frames off one peer connection for as long as it stays open,
/// routing each to its `(kind, tag, direction)` channel. Runs for the
/// lifetime of the connection; a read error or EOF ends it, after which any
/// caller still waiting on one of its channels blocks forever — the same
/// failure mode the teacher's single-stream design already had.
async fn demux_loop(rank: usize, peer_rank: usize, mut reader: OwnedReadHalf, conn: Arc<PeerConn>) {
    loop {
        match read_tagged_frame(&mut reader).await {
            Ok((key, payload)) => {
                let entry = conn.channel(key);
                if entry.tx.send(payload).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(rank, peer_rank, error = %err, "tcp transport: demux loop ended");
                break;
            }
        }
    }
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream, TransportError> {
    for attempt in 0..=RENDEZVOUS_RETRIES {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) if attempt < RENDEZVOUS_RETRIES => {
                debug!(%addr, attempt, error = %e, "tcp transport: connect retry");
                tokio::time::sleep(RENDEZVOUS_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(TransportError::Unreachable {
                    rank: 0,
                    reason: format!("connect to {addr} failed after {} attempts: {e}", attempt + 1),
                })
            }
        }
    }
    unreachable!()
}

async fn write_u32(stream: &mut TcpStream, value: u32) -> Result<(), TransportError> {
    stream
        .write_all(&value.to_le_bytes())
        .await
        .map_err(TransportError::Io)
}

async fn read_u32(stream: &mut TcpStream) -> Result<u32, TransportError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.map_err(TransportError::Io)?;
    Ok(u32::from_le_bytes(buf))
}

/// `[kind:u8][tag:u32][direction:u8][len:u32][payload...]`
async fn write_tagged_frame(
    writer: &mut OwnedWriteHalf,
    (kind, tag, direction): ChannelKey,
    payload: &[u8],
) -> Result<(), TransportError> {
    writer.write_u8(kind).await.map_err(TransportError::Io)?;
    writer
        .write_all(&tag.to_le_bytes())
        .await
        .map_err(TransportError::Io)?;
    writer.write_u8(direction).await.map_err(TransportError::Io)?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await
        .map_err(TransportError::Io)?;
    writer.write_all(payload).await.map_err(TransportError::Io)
}

async fn read_tagged_frame(
    reader: &mut OwnedReadHalf,
) -> Result<(ChannelKey, Vec<u8>), TransportError> {
    let kind = reader.read_u8().await.map_err(TransportError::Io)?;
    let mut tag_buf = [0u8; 4];
    reader
        .read_exact(&mut tag_buf)
        .await
        .map_err(TransportError::Io)?;
    let tag = u32::from_le_bytes(tag_buf);
    let direction = reader.read_u8().await.map_err(TransportError::Io)?;
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(TransportError::Io)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(TransportError::Io)?;
    Ok(((kind, tag, direction), payload))
}

/// This rank's handle into a [`TcpWorld`].
#[derive(Clone)]
pub struct TcpTransport {
    world: Arc<TcpWorld>,
}

#[derive(Debug)]
pub struct TcpGroup {
    lo: usize,
    hi: usize,
    tag: u32,
    direction: Direction,
}

impl Group for TcpGroup {
    fn members(&self) -> (usize, usize) {
        (self.lo, self.hi)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl TcpTransport {
    fn peer(&self, rank: usize) -> Result<&Arc<PeerConn>, TransportError> {
        self.world
            .peers
            .get(&rank)
            .ok_or(TransportError::NotInGroup { rank })
    }
}

#[async_trait]
impl CollectiveTransport for TcpTransport {
    fn rank(&self) -> usize {
        self.world.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }

    async fn all_gather_u32(&self, value: u32) -> Result<Vec<u32>, TransportError> {
        let key = allgather_u32_key();
        let mut result = vec![0u32; self.world.world_size];
        result[self.world.rank] = value;
        let payload = value.to_le_bytes();
        for (&peer_rank, conn) in &self.world.peers {
            conn.send(key, &payload).await?;
            let bytes = conn.recv(key).await?;
            let arr: [u8; 4] = bytes
                .try_into()
                .map_err(|_| TransportError::AllGather("malformed u32 frame".to_string()))?;
            result[peer_rank] = u32::from_le_bytes(arr);
        }
        Ok(result)
    }

    async fn all_gather_rows(&self, row: &[i64]) -> Result<Vec<Vec<i64>>, TransportError> {
        let key = allgather_rows_key();
        let mut result = vec![Vec::new(); self.world.world_size];
        result[self.world.rank] = row.to_vec();
        let payload: Vec<u8> = row.iter().flat_map(|v| v.to_le_bytes()).collect();
        for (&peer_rank, conn) in &self.world.peers {
            conn.send(key, &payload).await?;
            let bytes = conn.recv(key).await?;
            let row: Vec<i64> = bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            result[peer_rank] = row;
        }
        Ok(result)
    }

    fn new_group(
        &self,
        lo: usize,
        hi: usize,
        tag: u32,
        direction: Direction,
    ) -> Result<Box<dyn Group>, TransportError> {
        if lo >= hi {
            return Err(TransportError::GroupConstruction(format!(
                "expected lo < hi, got ({lo}, {hi})"
            )));
        }
        let peer_rank = if self.world.rank == lo { hi } else { lo };
        // Pre-register the channel so the demux loop always has somewhere to
        // route a frame that arrives before the first `recv` call.
        self.peer(peer_rank)?.channel(group_key(tag, direction));
        Ok(Box::new(TcpGroup { lo, hi, tag, direction }))
    }

    async fn broadcast(
        &self,
        group: &dyn Group,
        root: usize,
        payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError> {
        let group = group
            .as_any()
            .downcast_ref::<TcpGroup>()
            .expect("broadcast() called with a Group from a different transport backend");
        let (lo, hi) = (group.lo, group.hi);
        if root != lo && root != hi {
            return Err(TransportError::NotInGroup { rank: root });
        }
        let self_rank = self.world.rank;
        if self_rank != lo && self_rank != hi {
            return Err(TransportError::NotInGroup { rank: self_rank });
        }

        let key = group_key(group.tag, group.direction);
        if self_rank == root {
            let payload = payload.ok_or_else(|| {
                TransportError::Broadcast("root must supply a payload".to_string())
            })?;
            let peer_rank = if root == lo { hi } else { lo };
            self.peer(peer_rank)?.send(key, &payload).await?;
            Ok(payload)
        } else {
            self.peer(root)?.recv(key).await
        }
    }
}
