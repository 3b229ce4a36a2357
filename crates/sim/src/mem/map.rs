//! Address-range → controller tables.
//!
//! Controllers register themselves with the builder as they are
//! constructed; `freeze` scans the registry into per-kind lookup tables,
//! sorts each table by start address and checks the population against the
//! configured dimensions. After that the tables are read-only.

use log::debug;
use pando_api::{MemKind, PAddr, SysConfig};

use super::controller::{Controller, Interleave};
use crate::SimError;

pub struct MemoryMapBuilder {
    cfg: SysConfig,
    controllers: Vec<Controller>,
}

impl MemoryMapBuilder {
    pub fn new(cfg: &SysConfig) -> Self {
        Self { cfg: cfg.clone(), controllers: Vec::new() }
    }

    pub(crate) fn register(&mut self, ctrl: Controller) {
        self.controllers.push(ctrl);
    }

    #[cfg(test)]
    pub(crate) fn take_controllers(self) -> Vec<Controller> {
        self.controllers
    }

    /// Freeze the registry into routing tables.
    pub fn freeze(self) -> Result<MemoryMap, SimError> {
        let cfg = self.cfg;
        let pxns = cfg.num_pxn() as usize;
        let pods = cfg.pods_per_pxn() as usize;
        validate_striping(&cfg)?;

        let empty_pods = |_| (0..pods).map(|_| Vec::new()).collect::<Vec<_>>();
        let mut l1sp: Vec<Vec<Vec<Controller>>> = (0..pxns).map(empty_pods).collect();
        let mut l2sp: Vec<Vec<Vec<Controller>>> = (0..pxns).map(empty_pods).collect();
        let mut dram: Vec<Vec<Controller>> = (0..pxns).map(|_| Vec::new()).collect();

        for ctrl in self.controllers {
            let (pxn, pod) = (ctrl.pxn() as usize, ctrl.pod() as usize);
            if pxn >= pxns || pod >= pods {
                return Err(SimError::ConfigMismatch {
                    what: format!("controller registered outside the system at pxn {pxn} pod {pod}"),
                    found: pxn,
                    expected: pxns,
                });
            }
            match ctrl.kind() {
                MemKind::L1sp => l1sp[pxn][pod].push(ctrl),
                MemKind::L2sp => l2sp[pxn][pod].push(ctrl),
                MemKind::Dram => dram[pxn].push(ctrl),
            }
        }

        for pxn in 0..pxns {
            for pod in 0..pods {
                check_count(
                    &mut l1sp[pxn][pod],
                    cfg.cores_per_pod() as usize,
                    format!("L1SP banks for pxn {pxn} pod {pod}"),
                )?;
                check_count(
                    &mut l2sp[pxn][pod],
                    cfg.l2sp_banks() as usize,
                    format!("L2SP banks for pxn {pxn} pod {pod}"),
                )?;
            }
            check_count(
                &mut dram[pxn],
                cfg.dram_ports() as usize,
                format!("DRAM ports for pxn {pxn}"),
            )?;
        }

        debug!(
            "memory map frozen: {pxns} pxn(s), {pods} pod(s)/pxn, {} L1SP + {} L2SP banks/pod, {} DRAM port(s)/pxn",
            cfg.cores_per_pod(),
            cfg.l2sp_banks(),
            cfg.dram_ports()
        );

        let l2_interleave = Interleave::new(cfg.l2sp_interleave(), cfg.l2sp_banks() as u64);
        let dram_interleave = Interleave::new(cfg.dram_interleave(), cfg.dram_ports() as u64);
        Ok(MemoryMap { cfg, l1sp, l2sp, dram, l2_interleave, dram_interleave })
    }
}

fn check_count(
    table: &mut Vec<Controller>,
    expected: usize,
    what: String,
) -> Result<(), SimError> {
    if table.len() != expected {
        return Err(SimError::ConfigMismatch { what, found: table.len(), expected });
    }
    table.sort_by_key(|c| c.start());
    Ok(())
}

fn validate_striping(cfg: &SysConfig) -> Result<(), SimError> {
    for (what, n) in [
        ("l2sp bank count", cfg.l2sp_banks() as u64),
        ("l2sp interleave size", cfg.l2sp_interleave()),
        ("dram port count", cfg.dram_ports() as u64),
        ("dram interleave size", cfg.dram_interleave()),
    ] {
        if !n.is_power_of_two() {
            return Err(SimError::ConfigMismatch {
                what: format!("{what} must be a power of two"),
                found: n as usize,
                expected: n.next_power_of_two() as usize,
            });
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct MemoryMap {
    cfg: SysConfig,
    l1sp: Vec<Vec<Vec<Controller>>>,
    l2sp: Vec<Vec<Vec<Controller>>>,
    dram: Vec<Vec<Controller>>,
    l2_interleave: Interleave,
    dram_interleave: Interleave,
}

impl MemoryMap {
    /// Construct the full system's controllers from the configuration and
    /// freeze them in one go.
    pub fn build(cfg: &SysConfig) -> Result<Self, SimError> {
        validate_striping(cfg)?;
        let mut b = MemoryMapBuilder::new(cfg);
        let l2_ileave = Interleave::new(cfg.l2sp_interleave(), cfg.l2sp_banks() as u64);
        let dram_ileave = Interleave::new(cfg.dram_interleave(), cfg.dram_ports() as u64);
        for pxn in 0..cfg.num_pxn() as u16 {
            for pod in 0..cfg.pods_per_pxn() as u8 {
                for core in 0..cfg.cores_per_pod() {
                    let site = pando_api::Site::new(pxn, pod, core);
                    Controller::l1sp(&mut b, site, cfg.l1sp_size());
                }
                let bank_size = cfg.l2sp_size() / cfg.l2sp_banks() as u64;
                for bank in 0..cfg.l2sp_banks() {
                    Controller::l2sp_bank(&mut b, pxn, pod, bank, l2_ileave, bank_size);
                }
            }
            let port_size = cfg.dram_size() / cfg.dram_ports() as u64;
            for port in 0..cfg.dram_ports() {
                Controller::dram_port(&mut b, pxn, port, dram_ileave, port_size);
            }
        }
        b.freeze()
    }

    pub fn l2_interleave(&self) -> Interleave {
        self.l2_interleave
    }

    pub fn dram_interleave(&self) -> Interleave {
        self.dram_interleave
    }

    /// Resolve a physical address to its owning controller and the local
    /// offset within that controller's backing store.
    ///
    /// Control-register addresses never route here; they are delivered to
    /// cores, not controllers.
    pub fn route(&self, paddr: PAddr) -> Result<(&Controller, u64), SimError> {
        let misroute = || SimError::InvalidAddress { paddr };
        let ctrl = match paddr {
            PAddr::L1sp { pxn, pod, core_y, core_x, .. } => {
                let core = pando_api::locality::core_id_from_xy(core_x, core_y) as usize;
                self.l1sp
                    .get(pxn as usize)
                    .and_then(|p| p.get(pod as usize))
                    .and_then(|p| p.get(core))
                    .ok_or_else(misroute)?
            }
            PAddr::L2sp { pxn, pod, offset } => {
                let bank = self.l2_interleave.bank_of(offset as u64) as usize;
                self.l2sp
                    .get(pxn as usize)
                    .and_then(|p| p.get(pod as usize))
                    .and_then(|b| b.get(bank))
                    .ok_or_else(misroute)?
            }
            PAddr::Dram { pxn, offset } => {
                let port = self.dram_interleave.bank_of(offset) as usize;
                self.dram.get(pxn as usize).and_then(|p| p.get(port)).ok_or_else(misroute)?
            }
            PAddr::Ctrl { .. } => return Err(misroute()),
        };
        if !ctrl.owns(paddr) {
            return Err(misroute());
        }
        Ok((ctrl, ctrl.to_local(paddr)))
    }

    pub fn config(&self) -> &SysConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> SysConfig {
        SysConfig {
            sys_num_pxn: 2,
            sys_pxn_pods: 1,
            sys_pod_cores: 4,
            sys_pod_l2sp_banks: 2,
            sys_pxn_dram_ports: 4,
            sys_core_l1sp_size: 0x2000,
            sys_pod_l2sp_size: 1 << 20,
            sys_pxn_dram_size: 1 << 24,
            ..SysConfig::default()
        }
    }

    #[test]
    fn routes_target_the_owning_controller() {
        let map = MemoryMap::build(&small_cfg()).unwrap();
        let addrs = [
            PAddr::L1sp { pxn: 1, pod: 0, core_y: 0, core_x: 3, offset: 0x10 },
            PAddr::L2sp { pxn: 0, pod: 0, offset: 0x40 },
            PAddr::Dram { pxn: 1, offset: 0x100 },
        ];
        for paddr in addrs {
            let (ctrl, _) = map.route(paddr).unwrap();
            assert!(ctrl.owns(paddr), "{paddr}");
        }
    }

    #[test]
    fn dram_writes_walk_the_ports_in_order() {
        // interleave 64 B x 4 ports: offsets 0,64,128,192,256 -> ports 0,1,2,3,0
        let map = MemoryMap::build(&small_cfg()).unwrap();
        let ports: Vec<u32> = [0u64, 64, 128, 192, 256]
            .into_iter()
            .map(|off| map.route(PAddr::Dram { pxn: 0, offset: off }).unwrap().0.bank())
            .collect();
        assert_eq!(ports, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn l2_banks_collapse_to_local_offsets() {
        let map = MemoryMap::build(&small_cfg()).unwrap();
        // global stripe 5 is bank 1's third stripe (stripes 1, 3, 5)
        let paddr = PAddr::L2sp { pxn: 0, pod: 0, offset: 5 * 64 + 8 };
        let (ctrl, local) = map.route(paddr).unwrap();
        assert_eq!(ctrl.bank(), 1);
        assert_eq!(local, 2 * 64 + 8);
    }

    #[test]
    fn unpopulated_locations_are_misroutes() {
        let map = MemoryMap::build(&small_cfg()).unwrap();
        let paddr = PAddr::L2sp { pxn: 5, pod: 0, offset: 0 };
        assert!(matches!(map.route(paddr), Err(SimError::InvalidAddress { .. })));
        let paddr = PAddr::Ctrl { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0 };
        assert!(matches!(map.route(paddr), Err(SimError::InvalidAddress { .. })));
    }

    #[test]
    fn controller_counts_are_checked() {
        let cfg = small_cfg();
        let mut b = MemoryMapBuilder::new(&cfg);
        // register only one L1SP bank; config wants 4 cores x 2 pxns
        Controller::l1sp(&mut b, pando_api::Site::new(0, 0, 0), 0x2000);
        let err = b.freeze().unwrap_err();
        assert!(matches!(err, SimError::ConfigMismatch { .. }));
    }
}
