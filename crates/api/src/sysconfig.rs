//! The read-only system dimension record.
//!
//! Field names match the configuration surface keys, so a configuration
//! file deserializes straight into this struct. Defaults are the
//! simulator's historical ones.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SysConfig {
    pub sys_num_pxn: u32,
    pub sys_pxn_pods: u32,
    pub sys_pod_cores: u32,
    pub sys_core_threads: u32,
    pub sys_core_l1sp_size: u64,
    pub sys_pod_l2sp_size: u64,
    pub sys_pod_l2sp_banks: u32,
    pub sys_pod_l2sp_interleave_size: u64,
    pub sys_pxn_dram_size: u64,
    pub sys_pxn_dram_ports: u32,
    pub sys_pxn_dram_interleave_size: u64,
    pub sys_nw_flit_dwords: u32,
    pub sys_nw_obuf_dwords: u32,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            sys_num_pxn: 1,
            sys_pxn_pods: 1,
            sys_pod_cores: 1,
            sys_core_threads: 16,
            sys_core_l1sp_size: 128 * 1024,
            sys_pod_l2sp_size: 16 * 1024 * 1024,
            sys_pod_l2sp_banks: 1,
            sys_pod_l2sp_interleave_size: 64,
            sys_pxn_dram_size: 1024 * 1024 * 1024,
            sys_pxn_dram_ports: 1,
            sys_pxn_dram_interleave_size: 64,
            sys_nw_flit_dwords: 1,
            sys_nw_obuf_dwords: 1,
        }
    }
}

impl SysConfig {
    pub fn num_pxn(&self) -> u32 {
        self.sys_num_pxn
    }

    pub fn pods_per_pxn(&self) -> u32 {
        self.sys_pxn_pods
    }

    pub fn cores_per_pod(&self) -> u32 {
        self.sys_pod_cores
    }

    pub fn threads_per_core(&self) -> u32 {
        self.sys_core_threads
    }

    pub fn l1sp_size(&self) -> u64 {
        self.sys_core_l1sp_size
    }

    pub fn l2sp_size(&self) -> u64 {
        self.sys_pod_l2sp_size
    }

    pub fn l2sp_banks(&self) -> u32 {
        self.sys_pod_l2sp_banks
    }

    pub fn l2sp_interleave(&self) -> u64 {
        self.sys_pod_l2sp_interleave_size
    }

    pub fn dram_size(&self) -> u64 {
        self.sys_pxn_dram_size
    }

    pub fn dram_ports(&self) -> u32 {
        self.sys_pxn_dram_ports
    }

    pub fn dram_interleave(&self) -> u64 {
        self.sys_pxn_dram_interleave_size
    }

    /// Largest single memory request the network can carry, in bytes.
    /// Syscall buffer traffic is fragmented to this size.
    pub fn max_request_size(&self) -> usize {
        self.sys_nw_obuf_dwords as usize * size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_historical_parameters() {
        let cfg = SysConfig::default();
        assert_eq!(cfg.threads_per_core(), 16);
        assert_eq!(cfg.l1sp_size(), 131072);
        assert_eq!(cfg.l2sp_size(), 16777216);
        assert_eq!(cfg.dram_size(), 1073741824);
        assert_eq!(cfg.dram_interleave(), 64);
        assert_eq!(cfg.max_request_size(), 8);
    }

    #[test]
    fn config_surface_keys_deserialize() {
        let cfg: SysConfig = serde_json::from_str(
            r#"{"sys_num_pxn": 2, "sys_pod_cores": 8, "sys_pxn_dram_ports": 4}"#,
        )
        .unwrap();
        assert_eq!(cfg.num_pxn(), 2);
        assert_eq!(cfg.cores_per_pod(), 8);
        assert_eq!(cfg.dram_ports(), 4);
        assert_eq!(cfg.threads_per_core(), 16);
    }
}
