//! Multi-process training support using NCCL
//!
//! Gradients are averaged across ranks with an NCCL all-reduce before each
//! optimizer step, and initial parameters are broadcast from rank 0 so every
//! process starts from the same weights.

use candle_core::Tensor;
use candle_core::backprop::GradStore;
use candle_core::Var;

use crate::error::{Error, Result};

#[cfg(feature = "nccl")]
use cudarc::driver::safe::{CudaContext, CudaStream};
#[cfg(feature = "nccl")]
use cudarc::nccl::safe::{Comm, Id, ReduceOp};
#[cfg(feature = "nccl")]
use std::sync::Arc;

/// Placement of this process in the training group
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Total number of processes
    pub world_size: usize,
    /// This process's rank (0 to world_size-1)
    pub rank: usize,
    /// Path to communication file for NCCL ID exchange
    pub comm_file: String,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            comm_file: "nccl_id.txt".to_string(),
        }
    }
}

impl DistributedConfig {
    /// Builds the config from launcher arguments. A negative local rank means
    /// the process was started without a launcher and runs as rank 0.
    pub fn from_launcher(local_rank: i64, world_size: usize, comm_file: String) -> Result<Self> {
        let rank = usize::try_from(local_rank).unwrap_or(0);
        if world_size == 0 || rank >= world_size {
            return Err(Error::Distributed(format!(
                "rank {} is outside a world of size {}",
                rank, world_size
            )));
        }
        Ok(Self {
            world_size,
            rank,
            comm_file,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(feature = "nccl")]
fn nccl_error<E: std::fmt::Debug>(what: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Distributed(format!("{}: {:?}", what, e))
}

/// NCCL Communicator wrapper for gradient synchronization
#[cfg(feature = "nccl")]
pub struct NcclCommunicator {
    comm: Comm,
    stream: Arc<CudaStream>,
    rank: usize,
    world_size: usize,
}

#[cfg(feature = "nccl")]
impl NcclCommunicator {
    /// Rank 0 creates the NCCL ID and publishes it through `comm_file`;
    /// other ranks poll for the file and read the ID.
    pub fn new(config: &DistributedConfig) -> Result<Self> {
        use std::io::Write;

        let comm_file = std::path::PathBuf::from(&config.comm_file);

        let id = if config.rank == 0 {
            if comm_file.exists() {
                std::fs::remove_file(&comm_file)?;
            }
            let id = Id::new().map_err(nccl_error("failed to create NCCL ID"))?;

            // Write then rename so readers never observe a partial file
            let tmp_file = comm_file.with_extension("tmp");
            let mut file = std::fs::File::create(&tmp_file)?;
            file.write_all(&id.internal().iter().map(|&i| i as u8).collect::<Vec<_>>())?;
            std::fs::rename(&tmp_file, &comm_file)?;

            tracing::info!(path = ?comm_file, "rank 0 published NCCL ID");
            id
        } else {
            tracing::info!(rank = config.rank, "waiting for NCCL ID file");
            while !comm_file.exists() {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            std::thread::sleep(std::time::Duration::from_millis(100));

            let data = std::fs::read(&comm_file)?;
            let internal: [i8; 128] = data
                .into_iter()
                .map(|i| i as i8)
                .collect::<Vec<_>>()
                .try_into()
                .map_err(|_| Error::Distributed("invalid NCCL ID file".into()))?;
            Id::uninit(internal)
        };

        // One GPU per rank on a single node
        let ctx = CudaContext::new(config.rank).map_err(nccl_error("failed to create CUDA context"))?;
        let stream = ctx.default_stream();
        let comm = Comm::from_rank(stream.clone(), config.rank, config.world_size, id)
            .map_err(|e| Error::Distributed(format!("failed to create communicator: {:?}", e.0)))?;

        if config.rank == 0 {
            // Give the other ranks time to read the ID before removing it
            std::thread::sleep(std::time::Duration::from_secs(2));
            if comm_file.exists() {
                let _ = std::fs::remove_file(&comm_file);
            }
        }

        tracing::info!(rank = config.rank, world_size = config.world_size, "NCCL communicator ready");

        Ok(Self {
            comm,
            stream,
            rank: config.rank,
            world_size: config.world_size,
        })
    }

    /// Sum across all ranks, divided by the world size.
    pub fn all_reduce_avg(&self, tensor: &Tensor) -> Result<Tensor> {
        let reduced = self.all_reduce_sum(tensor)?;
        Ok(reduced.affine(1.0 / self.world_size as f64, 0.0)?)
    }

    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        let input = self
            .stream
            .clone_htod(&data)
            .map_err(nccl_error("host to device copy failed"))?;
        let mut output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(nccl_error("device allocation failed"))?;

        self.comm
            .all_reduce(&input, &mut output, &ReduceOp::Sum)
            .map_err(|e| Error::Distributed(format!("all-reduce failed: {:?}", e.0)))?;

        let host = self
            .stream
            .clone_dtoh(&output)
            .map_err(nccl_error("device to host copy failed"))?;
        Ok(Tensor::from_vec(host, tensor.shape(), tensor.device())?)
    }

    /// Rank 0's values, on every rank.
    pub fn broadcast(&self, tensor: &Tensor) -> Result<Tensor> {
        let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        let input = if self.rank == 0 {
            Some(
                self.stream
                    .clone_htod(&data)
                    .map_err(nccl_error("host to device copy failed"))?,
            )
        } else {
            None
        };
        let mut output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(nccl_error("device allocation failed"))?;

        self.comm
            .broadcast(input.as_ref(), &mut output, 0)
            .map_err(|e| Error::Distributed(format!("broadcast failed: {:?}", e.0)))?;

        let host = self
            .stream
            .clone_dtoh(&output)
            .map_err(nccl_error("device to host copy failed"))?;
        Ok(Tensor::from_vec(host, tensor.shape(), tensor.device())?)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Stub communicator for non-NCCL builds
#[cfg(not(feature = "nccl"))]
pub struct NcclCommunicator {
    rank: usize,
    world_size: usize,
}

#[cfg(not(feature = "nccl"))]
impl NcclCommunicator {
    pub fn new(config: &DistributedConfig) -> Result<Self> {
        Err(Error::Distributed(format!(
            "world size {} needs NCCL support; build with --features nccl",
            config.world_size
        )))
    }

    pub fn all_reduce_avg(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    pub fn broadcast(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Replace every gradient with its average across ranks.
pub fn all_reduce_gradients(
    grads: &mut GradStore,
    vars: &[Var],
    comm: &NcclCommunicator,
) -> Result<()> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let averaged = comm.all_reduce_avg(grad)?;
        grads.insert(var.as_tensor(), averaged);
    }
    Ok(())
}

/// Overwrite every parameter with rank 0's copy.
pub fn broadcast_parameters(vars: &[Var], comm: &NcclCommunicator) -> Result<()> {
    for var in vars {
        let synced = comm.broadcast(var.as_tensor())?;
        var.set(&synced)?;
    }
    Ok(())
}
