//! Process-group bootstrap and the collectives the trainer relies on.
//!
//! Every worker must issue the same collectives in the same order. None of
//! them time out; a peer that disappears surfaces as
//! [`TrainingError::Collective`] on the ranks still waiting.

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use candle_core::Device;

use crate::TrainingError;

pub mod local;
pub mod tcp;

pub use local::LocalGroup;
pub use tcp::TcpGroup;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Collective primitives over `f64` buffers.
pub trait Collective: Send + Sync {
    /// Element-wise sum across all ranks; every rank ends with the same bits.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError>;

    /// Overwrites `values` on every rank with rank 0's buffer.
    fn broadcast(&self, values: &mut [f64]) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError>;
}

/// Single-process group; every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl Collective for Standalone {
    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f64]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Launcher-provided process layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedEnv {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
    /// Host name or IP literal of rank 0.
    pub master_addr: String,
    pub master_port: u16,
}

impl DistributedEnv {
    pub fn from_env() -> Result<Self, TrainingError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses the torchrun-style variables through `lookup`. A missing
    /// `WORLD_SIZE` means a single process.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TrainingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let world_size = match lookup("WORLD_SIZE") {
            Some(value) => parse_var::<usize>("WORLD_SIZE", &value)?,
            None => 1,
        };
        if world_size == 0 {
            return Err(TrainingError::config("WORLD_SIZE must be at least 1"));
        }

        let rank = match lookup("RANK") {
            Some(value) => parse_var::<usize>("RANK", &value)?,
            None if world_size == 1 => 0,
            None => {
                return Err(TrainingError::config(format!(
                    "RANK is required when WORLD_SIZE is {}",
                    world_size
                )))
            }
        };
        if rank >= world_size {
            return Err(TrainingError::config(format!(
                "RANK {} is out of range for WORLD_SIZE {}",
                rank, world_size
            )));
        }

        let local_rank = match lookup("LOCAL_RANK") {
            Some(value) => parse_var::<usize>("LOCAL_RANK", &value)?,
            None => rank,
        };
        let master_addr = match lookup("MASTER_ADDR") {
            Some(value) if value.trim().is_empty() => {
                return Err(TrainingError::config("MASTER_ADDR must not be empty"))
            }
            Some(value) if value.trim().chars().any(char::is_whitespace) => {
                return Err(TrainingError::config(format!(
                    "MASTER_ADDR '{}' is not a host name",
                    value
                )))
            }
            Some(value) => value.trim().to_string(),
            None => DEFAULT_MASTER_ADDR.to_string(),
        };
        let master_port = match lookup("MASTER_PORT") {
            Some(value) => parse_var::<u16>("MASTER_PORT", &value)?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(Self {
            world_size,
            rank,
            local_rank,
            master_addr,
            master_port,
        })
    }
}

impl DistributedEnv {
    /// Resolves `MASTER_ADDR:MASTER_PORT`, preferring an IPv4 address.
    pub fn master_socket_addr(&self) -> Result<SocketAddr, TrainingError> {
        let addrs: Vec<SocketAddr> = (self.master_addr.as_str(), self.master_port)
            .to_socket_addrs()
            .map_err(|err| {
                TrainingError::config(format!(
                    "failed to resolve MASTER_ADDR '{}': {}",
                    self.master_addr, err
                ))
            })?
            .collect();
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                TrainingError::config(format!(
                    "MASTER_ADDR '{}' resolved to no address",
                    self.master_addr
                ))
            })
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, TrainingError>
where
    T: std::str::FromStr,
{
    value.trim().parse::<T>().map_err(|_| {
        TrainingError::config(format!("{} has an unparsable value '{}'", name, value))
    })
}

/// Rank layout, compute device and collective backend for one worker.
#[derive(Clone)]
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    device: Device,
    collective: Arc<dyn Collective>,
}

impl DistributedContext {
    pub fn standalone() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            device: Device::Cpu,
            collective: Arc::new(Standalone),
        }
    }

    pub fn new(rank: usize, world_size: usize, collective: Arc<dyn Collective>) -> Self {
        Self {
            rank,
            world_size,
            local_rank: rank,
            device: Device::Cpu,
            collective,
        }
    }

    /// Reads the launcher environment and joins the process group.
    pub fn init_from_env() -> Result<Self, TrainingError> {
        let env = DistributedEnv::from_env()?;
        Self::init(&env)
    }

    pub fn init(env: &DistributedEnv) -> Result<Self, TrainingError> {
        if env.world_size == 1 {
            log::info!("not using distributed mode");
            let mut ctx = Self::standalone();
            ctx.local_rank = env.local_rank;
            return Ok(ctx);
        }

        log::info!(
            "distributed init (rank {}): tcp://{}:{}",
            env.rank,
            env.master_addr,
            env.master_port
        );
        let group = TcpGroup::connect(
            env.rank,
            env.world_size,
            env.master_socket_addr()?,
            DEFAULT_CONNECT_TIMEOUT,
        )?;
        group.barrier()?;
        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            local_rank: env.local_rank,
            device: Device::Cpu,
            collective: Arc::new(group),
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        if self.world_size == 1 || values.is_empty() {
            return Ok(());
        }
        self.collective.all_reduce_sum(values)
    }

    pub fn all_reduce_mean_in_place(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        self.all_reduce_sum(values)?;
        if self.world_size > 1 {
            let scale = self.world_size as f64;
            values.iter_mut().for_each(|value| *value /= scale);
        }
        Ok(())
    }

    pub fn all_reduce_mean(&self, value: f64) -> Result<f64, TrainingError> {
        let mut buffer = [value];
        self.all_reduce_mean_in_place(&mut buffer)?;
        Ok(buffer[0])
    }

    pub fn broadcast_from_main(&self, values: &mut [f64]) -> Result<(), TrainingError> {
        if self.world_size == 1 || values.is_empty() {
            return Ok(());
        }
        self.collective.broadcast(values)
    }

    pub fn barrier(&self) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }
        self.collective.barrier()
    }
}

impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_rank", &self.local_rank)
            .field("device", &self.device)
            .finish()
    }
}
