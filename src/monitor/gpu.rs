//! Optional GPU sensing. Absence of a GPU or of the NVML library gives
//! `None` readings and disables GPU thresholds without error.

/// Static description of the detected GPU devices.
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    pub device_count: u32,
    pub total_memory_mb: u64,
    pub device_names: Vec<String>,
}

#[cfg(feature = "nvidia-support")]
pub fn detect() -> bool {
    use nvml_wrapper::Nvml;
    match Nvml::init() {
        Ok(nvml) => nvml.device_count().map(|count| count > 0).unwrap_or(false),
        Err(_) => {
            tracing::debug!("NVML not available, GPU sensing disabled");
            false
        }
    }
}

#[cfg(feature = "nvidia-support")]
pub fn sample() -> (Option<f64>, Option<f64>) {
    use nvml_wrapper::Nvml;

    let Ok(nvml) = Nvml::init() else {
        return (None, None);
    };
    let Ok(device) = nvml.device_by_index(0) else {
        return (None, None);
    };

    let utilization = device
        .utilization_rates()
        .ok()
        .map(|rates| rates.gpu as f64);
    let memory = device.memory_info().ok().and_then(|info| {
        if info.total > 0 {
            Some(info.used as f64 / info.total as f64 * 100.0)
        } else {
            None
        }
    });
    (utilization, memory)
}

#[cfg(feature = "nvidia-support")]
pub fn device_info() -> Option<GpuDeviceInfo> {
    use nvml_wrapper::Nvml;

    let nvml = Nvml::init().ok()?;
    let count = nvml.device_count().ok()?;
    if count == 0 {
        return None;
    }

    let mut total_memory_mb = 0u64;
    let mut device_names = Vec::new();
    for index in 0..count {
        if let Ok(device) = nvml.device_by_index(index) {
            if let Ok(memory) = device.memory_info() {
                total_memory_mb += memory.total / (1024 * 1024);
            }
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }
    }

    Some(GpuDeviceInfo {
        device_count: count,
        total_memory_mb,
        device_names,
    })
}

#[cfg(not(feature = "nvidia-support"))]
pub fn detect() -> bool {
    false
}

#[cfg(not(feature = "nvidia-support"))]
pub fn sample() -> (Option<f64>, Option<f64>) {
    (None, None)
}

#[cfg(not(feature = "nvidia-support"))]
pub fn device_info() -> Option<GpuDeviceInfo> {
    None
}
