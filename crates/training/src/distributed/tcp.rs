//! Star-topology TCP process group.
//!
//! Rank 0 accepts one connection per peer and performs every reduction in
//! rank order before sending the result back, so all ranks observe the same
//! floating point sum.
//!
//! Frame layout: `u8 opcode | u32 LE element count | count × f64 LE`.

use std::{
    io::{BufReader, BufWriter, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use super::Collective;
use crate::TrainingError;

const OP_HELLO: u8 = 0;
const OP_ALL_REDUCE: u8 = 1;
const OP_BROADCAST: u8 = 2;
const OP_BARRIER: u8 = 3;
const OP_RESULT: u8 = 4;

const HEADER_LEN: usize = 5;
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

struct Peer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Peer {
    fn new(stream: TcpStream) -> Result<Self, TrainingError> {
        stream.set_nodelay(true).map_err(io_error)?;
        let reader = BufReader::new(stream.try_clone().map_err(io_error)?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, opcode: u8, values: &[f64]) -> Result<(), TrainingError> {
        let frame = encode_frame(opcode, values)?;
        self.writer.write_all(&frame).map_err(io_error)?;
        self.writer.flush().map_err(io_error)
    }

    fn recv(&mut self) -> Result<(u8, Vec<f64>), TrainingError> {
        let mut header = [0u8; HEADER_LEN];
        self.reader.read_exact(&mut header).map_err(io_error)?;
        let mut header = &header[..];
        let opcode = header.get_u8();
        let count = header.get_u32_le() as usize;
        let mut payload = vec![0u8; count * 8];
        self.reader.read_exact(&mut payload).map_err(io_error)?;
        let mut payload = &payload[..];
        let values = (0..count).map(|_| payload.get_f64_le()).collect();
        Ok((opcode, values))
    }

    fn expect(&mut self, opcode: u8, len: usize) -> Result<Vec<f64>, TrainingError> {
        let (received, values) = self.recv()?;
        if received != opcode {
            return Err(TrainingError::collective(format!(
                "expected opcode {} but received {}; ranks issued different collectives",
                opcode, received
            )));
        }
        if values.len() != len {
            return Err(TrainingError::collective(format!(
                "expected {} values but received {}",
                len,
                values.len()
            )));
        }
        Ok(values)
    }
}

fn encode_frame(opcode: u8, values: &[f64]) -> Result<BytesMut, TrainingError> {
    let count = u32::try_from(values.len())
        .map_err(|_| TrainingError::collective("collective payload too large"))?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + values.len() * 8);
    frame.put_u8(opcode);
    frame.put_u32_le(count);
    for value in values {
        frame.put_f64_le(*value);
    }
    Ok(frame)
}

enum Role {
    /// Peers of rank 0, indexed by `rank - 1`.
    Root(Vec<Peer>),
    Worker(Peer),
}

pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Mutex<Role>,
}

impl TcpGroup {
    /// Rank 0 binds `master`; every other rank connects to it, retrying until
    /// `connect_timeout` elapses.
    pub fn connect(
        rank: usize,
        world_size: usize,
        master: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, TrainingError> {
        if rank >= world_size {
            return Err(TrainingError::config(format!(
                "rank {} is out of range for world size {}",
                rank, world_size
            )));
        }
        let role = if rank == 0 {
            let listener = TcpListener::bind(master).map_err(|err| {
                TrainingError::collective(format!("failed to bind {}: {}", master, err))
            })?;
            Role::Root(accept_peers(&listener, world_size)?)
        } else {
            Role::Worker(connect_to_root(rank, master, connect_timeout)?)
        };
        Ok(Self {
            rank,
            world_size,
            role: Mutex::new(role),
        })
    }

    /// Variant of [`TcpGroup::connect`] for rank 0 with a listener that is
    /// already bound.
    pub fn from_listener(listener: TcpListener, world_size: usize) -> Result<Self, TrainingError> {
        Ok(Self {
            rank: 0,
            world_size,
            role: Mutex::new(Role::Root(accept_peers(&listener, world_size)?)),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn exchange(&self, opcode: u8, values: &mut [f64]) -> Result<(), TrainingError> {
        let mut role = self.role.lock();
        match &mut *role {
            Role::Root(peers) => {
                if opcode != OP_BROADCAST {
                    for peer in peers.iter_mut() {
                        let incoming = peer.expect(opcode, values.len())?;
                        if opcode == OP_ALL_REDUCE {
                            for (acc, value) in values.iter_mut().zip(incoming) {
                                *acc += value;
                            }
                        }
                    }
                }
                for peer in peers.iter_mut() {
                    peer.send(OP_RESULT, values)?;
                }
            }
            Role::Worker(root) => {
                if opcode != OP_BROADCAST {
                    root.send(opcode, values)?;
                }
                let result = root.expect(OP_RESULT, values.len())?;
                values.copy_from_slice(&result);
            }
        }
        Ok(())
    }
}

impl Collective for TcpGroup {
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.exchange(OP_ALL_REDUCE, values)
    }

    fn broadcast(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.exchange(OP_BROADCAST, values)
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.exchange(OP_BARRIER, &mut [])
    }
}

fn accept_peers(listener: &TcpListener, world_size: usize) -> Result<Vec<Peer>, TrainingError> {
    let mut slots: Vec<Option<Peer>> = (1..world_size).map(|_| None).collect();
    let mut pending = world_size - 1;
    while pending > 0 {
        let (stream, addr) = listener.accept().map_err(io_error)?;
        let mut peer = Peer::new(stream)?;
        let hello = peer.expect(OP_HELLO, 1)?;
        let rank = hello[0] as usize;
        if rank == 0 || rank >= world_size || hello[0].fract() != 0.0 {
            return Err(TrainingError::collective(format!(
                "peer {} announced invalid rank {}",
                addr, hello[0]
            )));
        }
        let slot = &mut slots[rank - 1];
        if slot.is_some() {
            return Err(TrainingError::collective(format!(
                "rank {} connected twice",
                rank
            )));
        }
        log::debug!("rank {} joined from {}", rank, addr);
        *slot = Some(peer);
        pending -= 1;
    }
    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_root(
    rank: usize,
    master: SocketAddr,
    timeout: Duration,
) -> Result<Peer, TrainingError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(master) {
            Ok(stream) => {
                let mut peer = Peer::new(stream)?;
                peer.send(OP_HELLO, &[rank as f64])?;
                return Ok(peer);
            }
            Err(err) if Instant::now() < deadline => {
                log::debug!("rank {} waiting for {}: {}", rank, master, err);
                thread::sleep(RETRY_INTERVAL);
            }
            Err(err) => {
                return Err(TrainingError::collective(format!(
                    "rank {} could not reach {} within {:?}: {}",
                    rank, master, timeout, err
                )))
            }
        }
    }
}

fn io_error(err: std::io::Error) -> TrainingError {
    TrainingError::collective(err.to_string())
}
