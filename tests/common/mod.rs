#![allow(dead_code)]

use std::sync::Arc;

use logseg::gc::GcDependencies;
use logseg::io::{IoDirection, IoSubmitter, MemDevice, Ubio};
use logseg::reverse_map::{MemReverseMap, MemVsaMap, VsaMap};
use logseg::scheduler::EventScheduler;
use logseg::{
    Config, ContextManager, MemFile, Rba, Result, Stripe, StripeAllocator,
    StripeId, StripeOwner, VirtualBlkAddr, VolumeId,
};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|p| p.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// A small array: 8 segments of 4 stripes of 4 blocks.
pub fn small_config() -> Config {
    Config::new()
        .num_segments(8)
        .stripes_per_segment(4)
        .blocks_per_stripe(4)
        .block_size(16)
        .gc_copy_lanes(2)
        .gc_buffer_count(8)
        .gc_buffer_retry_limit(1_000_000)
        .gc_normal_threshold(3)
        .gc_urgent_threshold(1)
        .scheduler_threads(2)
}

/// Contents written for `rba` of `volume_id` at `version`.
pub fn block_pattern(
    block_size: usize,
    volume_id: VolumeId,
    rba: Rba,
    version: u8,
) -> Vec<u8> {
    let mut data = vec![version; block_size];
    data[..8].copy_from_slice(&rba.to_le_bytes());
    data[8] = volume_id as u8;
    data
}

/// The allocator core wired to in-memory collaborators, plus a user
/// write path driving it the way the front end would.
pub struct Harness {
    pub config: Config,
    pub context: Arc<ContextManager>,
    pub device: Arc<MemDevice>,
    pub reverse_map: Arc<MemReverseMap>,
    pub vsa_map: Arc<MemVsaMap>,
    pub segment_file: MemFile,
    pub rebuild_file: MemFile,
    pub allocator_file: MemFile,
    user_allocator: StripeAllocator,
}

impl Harness {
    pub fn new(config: Config) -> Harness {
        Harness::with_files(
            config,
            MemFile::new("segment_ctx"),
            MemFile::new("rebuild_ctx"),
            MemFile::new("allocator_ctx"),
        )
    }

    /// Files are shared with clones, so passing the files of a previous
    /// harness simulates a restart.
    pub fn with_files(
        config: Config,
        segment_file: MemFile,
        rebuild_file: MemFile,
        allocator_file: MemFile,
    ) -> Harness {
        let context = Arc::new(
            ContextManager::with_files(
                &config,
                Arc::new(segment_file.clone()),
                Arc::new(rebuild_file.clone()),
                Arc::new(allocator_file.clone()),
            )
            .unwrap(),
        );
        let address = config.address_info();
        Harness {
            user_allocator: StripeAllocator::new(
                context.clone(),
                StripeOwner::User,
            ),
            context,
            device: Arc::new(MemDevice::new(config.block_size)),
            reverse_map: Arc::new(MemReverseMap::new(
                address.blocks_per_stripe,
            )),
            vsa_map: Arc::new(MemVsaMap::new()),
            segment_file,
            rebuild_file,
            allocator_file,
            config,
        }
    }

    pub fn deps(&self, scheduler: Arc<dyn EventScheduler>) -> GcDependencies {
        GcDependencies::new(
            self.context.clone(),
            self.device.clone(),
            self.reverse_map.clone(),
            self.vsa_map.clone(),
            scheduler,
        )
    }

    pub fn write_stripe(
        &self,
        volume_id: VolumeId,
        rbas: &[Rba],
        version: u8,
    ) -> StripeId {
        self.try_write_stripe(volume_id, rbas, version).unwrap()
    }

    /// Writes `rbas` into a fresh stripe, one block each, and destages
    /// it. Unused tail blocks stay unmapped. Fails without side effects
    /// when no stripe can be allocated, including while user allocation
    /// is prohibited.
    pub fn try_write_stripe(
        &self,
        volume_id: VolumeId,
        rbas: &[Rba],
        version: u8,
    ) -> Result<StripeId> {
        let address = self.context.address_info();
        assert!(rbas.len() <= address.blocks_per_stripe as usize);

        let lsid = self.user_allocator.allocate_stripe()?;
        let stripe = Stripe::new(address.blocks_per_stripe);
        stripe
            .assign(lsid, Some(lsid), lsid, volume_id, &*self.reverse_map)
            .unwrap();

        for (offset, rba) in rbas.iter().enumerate() {
            let vsa = VirtualBlkAddr::new(lsid, offset as u32);
            let ubio = Ubio {
                direction: IoDirection::Write,
                addr: vsa,
                buffer: block_pattern(
                    self.config.block_size,
                    volume_id,
                    *rba,
                    version,
                ),
            };
            self.device.submit(ubio, Box::new(|_, res| res.unwrap()));

            stripe.update_reverse_map_entry(offset as u32, *rba, volume_id).unwrap();
            self.context.validate_blocks(vsa, 1);
            if let Some(old) = self.vsa_map.set_vsa(volume_id, *rba, vsa) {
                self.context.invalidate_blocks(old, 1);
            }
        }

        assert_eq!(stripe.decrease_blks_remaining(address.blocks_per_stripe), 0);
        stripe.flush(Box::new(|res| res.unwrap())).unwrap();
        self.context.update_occupied_stripe_count(lsid);
        stripe.set_finished();

        Ok(lsid)
    }

    /// Writes `rbas` of volume 0, one stripe at a time.
    pub fn write_blocks(&self, rbas: std::ops::Range<Rba>, version: u8) {
        let per_stripe = self.context.address_info().blocks_per_stripe as usize;
        let rbas: Vec<Rba> = rbas.collect();
        for chunk in rbas.chunks(per_stripe) {
            self.write_stripe(0, chunk, version);
        }
    }

    pub fn read(&self, volume_id: VolumeId, rba: Rba) -> Option<Vec<u8>> {
        let vsa = self.vsa_map.get_vsa(volume_id, rba)?;
        self.device.read_block(vsa)
    }

    /// Panics unless every counter is within bounds and the valid counts
    /// match the forward map.
    pub fn check_invariants(&self, volume_id: VolumeId, rbas: &[Rba]) {
        let address = self.context.address_info();
        let segment_ctx = self.context.segment_ctx();

        let mut expected = vec![0_u32; address.num_segments as usize];
        for rba in rbas {
            if let Some(vsa) = self.vsa_map.get_vsa(volume_id, *rba) {
                expected[address.segment_of_vsa(vsa) as usize] += 1;
            }
        }

        for segment_id in 0..address.num_segments {
            let info = segment_ctx.segment_info(segment_id);
            assert!(info.valid_block_count <= address.blocks_per_segment());
            assert!(info.occupied_stripe_count <= address.stripes_per_segment);
            assert_eq!(
                info.valid_block_count, expected[segment_id as usize],
                "valid count of segment {}",
                segment_id
            );
        }
    }
}
