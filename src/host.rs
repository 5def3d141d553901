use sysinfo::{System, SystemExt};

/// Host facts read once per report.
pub trait HostProbe: Send + Sync {
    fn host_name(&self) -> Option<String>;
    /// Physical memory in bytes, `None` when it cannot be determined.
    fn total_memory_bytes(&self) -> Option<u64>;
    fn current_user(&self) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct SysinfoProbe;

impl HostProbe for SysinfoProbe {
    fn host_name(&self) -> Option<String> {
        System::new().host_name().filter(|h| !h.trim().is_empty())
    }

    fn total_memory_bytes(&self) -> Option<u64> {
        let mut system = System::new();
        system.refresh_memory();
        Some(system.total_memory()).filter(|total| *total > 0)
    }

    fn current_user(&self) -> Option<String> {
        ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::HostProbe;

    #[derive(Debug, Clone, Default)]
    pub struct FixedHost {
        pub host_name: Option<String>,
        pub total_memory_bytes: Option<u64>,
        pub user: Option<String>,
    }

    impl HostProbe for FixedHost {
        fn host_name(&self) -> Option<String> {
            self.host_name.clone()
        }

        fn total_memory_bytes(&self) -> Option<u64> {
            self.total_memory_bytes
        }

        fn current_user(&self) -> Option<String> {
            self.user.clone()
        }
    }
}
