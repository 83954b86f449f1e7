//! Compute device selection and resource probing
//!
//! Device choice only affects throughput. Accelerator detection uses wgpu
//! adapters and is compiled in with the `gpu` feature; without it every
//! run selects the CPU.

use std::fmt;

use tracing::info;

/// Accelerator adapter found by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    /// Adapter name reported by the driver
    pub name: String,
    /// Graphics backend (Vulkan, Metal, ...)
    pub backend: String,
}

/// Compute device for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// General-purpose compute
    Cpu,
    /// GPU or equivalent
    Accelerator(AcceleratorInfo),
}

impl Device {
    /// Prefer an accelerator only when requested and available.
    #[must_use]
    pub fn select(use_gpu: bool, resources: &SystemResources) -> Self {
        let device = match resources.accelerators.first() {
            Some(accelerator) if use_gpu => Self::Accelerator(accelerator.clone()),
            _ => Self::Cpu,
        };
        info!(requested_gpu = use_gpu, device = %device, "compute device selected");
        device
    }

    /// True for [`Device::Accelerator`].
    #[must_use]
    pub const fn is_accelerator(&self) -> bool {
        matches!(self, Self::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator(info) => write!(f, "{} ({})", info.name, info.backend),
        }
    }
}

/// CPU and accelerator inventory of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemResources {
    /// Logical CPUs
    pub cpu_count: usize,
    /// Accelerator adapters, best first
    pub accelerators: Vec<AcceleratorInfo>,
}

impl SystemResources {
    /// Probe the host.
    #[must_use]
    pub fn detect() -> Self {
        let resources = Self {
            cpu_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            accelerators: probe_accelerators(),
        };
        info!(
            cpus = resources.cpu_count,
            accelerators = resources.accelerators.len(),
            "system resources"
        );
        resources
    }

    /// CPU-only inventory, e.g. for tests.
    #[must_use]
    pub const fn cpu_only(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            accelerators: Vec::new(),
        }
    }

    /// Concurrent client workers when each client reserves `cpus_per_client`.
    #[must_use]
    pub fn workers_for(&self, cpus_per_client: usize) -> usize {
        (self.cpu_count / cpus_per_client.max(1)).max(1)
    }
}

#[cfg(feature = "gpu")]
fn probe_accelerators() -> Vec<AcceleratorInfo> {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!(error = %e, "cannot start probe runtime, assuming no accelerator");
            return Vec::new();
        }
    };
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = runtime.block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter
        .map(|adapter| adapter.get_info())
        .filter(|info| info.device_type != wgpu::DeviceType::Cpu)
        .map(|info| AcceleratorInfo {
            name: info.name,
            backend: format!("{:?}", info.backend),
        })
        .into_iter()
        .collect()
}

#[cfg(not(feature = "gpu"))]
const fn probe_accelerators() -> Vec<AcceleratorInfo> {
    Vec::new()
}
