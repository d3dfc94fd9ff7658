//! Iterative migration driver: Setup → Iterate-until-converged →
//! Complete/Cancel state machine. Drives the registry, dirty log, cache and
//! codec; is itself registered as the "ram" save-state handler.

use log::{debug, trace, warn};

use crate::accounting::MigrationAccounting;
use crate::cache::PageCache;
use crate::codec::{self, DecodedRecord, PageDecoder, PageEncoder, PageRecord, XbzrleEncodeResult};
use crate::config::MigrationConfig;
use crate::dirty::{DirtyLog, DirtySyncSource, NoExternalDirtySource};
use crate::error::MigrationError;
use crate::handler::{RecvStream, SaveStateHandler, SendStream};
use crate::ram::{BlockHandle, RamBlockRegistry};
use crate::timer::Timer;
use crate::PAGE_SIZE;

const MIGRATION_STREAM_VERSION: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Setup,
    Iterate,
    Complete,
    Cancelled,
}

/// The round-robin scan position, carried across iterations without reset
/// (design note "cyclic block list" — an index into a frozen `Vec`, not an
/// intrusive linked list).
#[derive(Debug, Clone, Copy)]
struct Cursor {
    block_idx: usize,
    offset: u64,
}

impl Cursor {
    fn start() -> Self {
        Self {
            block_idx: 0,
            offset: 0,
        }
    }

    fn advance(&mut self, order: &[BlockHandle]) {
        if order.is_empty() {
            return;
        }
        self.offset += PAGE_SIZE as u64;
        if self.offset >= order[self.block_idx].length() {
            self.offset = 0;
            self.block_idx = (self.block_idx + 1) % order.len();
        }
    }
}

pub struct MigrationState {
    pub phase: Phase,
    pub bytes_transferred: u64,
    cursor: Cursor,
    pub accounting: MigrationAccounting,
    last_bandwidth_bps: f64,
}

impl MigrationState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            bytes_transferred: 0,
            cursor: Cursor::start(),
            accounting: MigrationAccounting::default(),
            last_bandwidth_bps: 0.0,
        }
    }
}

/// Load-side hook for platform-specific handling of zero pages (e.g.
/// `madvise(MADV_DONTNEED)`), so the crate stays platform-agnostic while the
/// source's discard-on-zero optimization remains expressible.
pub trait RamSink {
    fn discard(&mut self, _block_id: &str, _offset: u64, _len: u64) {}
}

/// A sink that does nothing; the default when the host has no discard hint
/// to wire up.
pub struct NullRamSink;
impl RamSink for NullRamSink {}

pub struct MigrationDriver {
    registry: RamBlockRegistry,
    dirty: DirtyLog,
    cache: Option<PageCache>,
    config: MigrationConfig,
    state: MigrationState,
    encoder: PageEncoder,
    decoder: PageDecoder,
    order: Vec<BlockHandle>,
    sink: Box<dyn RamSink + Send>,
}

impl MigrationDriver {
    pub fn new(config: MigrationConfig) -> Self {
        Self {
            registry: RamBlockRegistry::new(),
            dirty: DirtyLog::new(),
            cache: None,
            config,
            state: MigrationState::new(),
            encoder: PageEncoder::new(),
            decoder: PageDecoder::new(),
            order: Vec::new(),
            sink: Box::new(NullRamSink),
        }
    }

    pub fn with_ram_sink(mut self, sink: Box<dyn RamSink + Send>) -> Self {
        self.sink = sink;
        self
    }

    /// Blocks must be registered before `Setup` runs.
    pub fn registry(&self) -> &RamBlockRegistry {
        &self.registry
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state.bytes_transferred
    }

    pub fn accounting(&self) -> MigrationAccounting {
        self.state.accounting
    }

    /// Bytes/sec measured over the most recent `iterate()` pass.
    pub fn bandwidth_estimate(&self) -> f64 {
        self.state.last_bandwidth_bps
    }

    /// Re-marks a page dirty outside the normal dirty-tracking path, for a
    /// host that observed a guest write through some side channel (or a
    /// test simulating one). A no-op before `setup()` has registered the
    /// block.
    pub fn mark_dirty(&mut self, block_id: &str, offset: u64, len: u64) {
        self.dirty.mark(block_id, offset, len);
    }

    fn total_pages(&self) -> u64 {
        self.order.iter().map(|b| b.page_count()).sum()
    }

    fn transition(&mut self, to: Phase) {
        debug!("migration: {:?} -> {:?}", self.state.phase, to);
        self.state.phase = to;
    }

    /// Resets accounting, freezes block order, marks every page dirty,
    /// enables logging, optionally initializes the XBZRLE cache, and writes
    /// the manifest.
    pub fn setup(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        self.state = MigrationState::new();
        self.order = self.registry.sort();

        for block in self.order.iter() {
            self.dirty.register_block(block.id(), block.length());
            self.dirty.mark_all(block.id());
        }
        self.dirty.enable_logging();

        if self.config.xbzrle_enabled {
            let pages = (self.config.xbzrle_cache_bytes / PAGE_SIZE as u64).max(1) as usize;
            self.cache = Some(PageCache::init(pages, PAGE_SIZE)?);
        }

        let total_bytes = self.registry.total_bytes();
        stream.put_be64(total_bytes | codec::FLAG_MEM_SIZE);
        for block in self.order.iter() {
            stream.put_u8(block.id().len() as u8);
            stream.put_bytes(block.id().as_bytes());
            stream.put_be64(block.length());
        }
        stream.put_be64(codec::FLAG_EOS);

        if let Some(err) = stream.error() {
            self.transition(Phase::Cancelled);
            return Err(MigrationError::StreamIo(err.to_string()));
        }

        self.transition(Phase::Iterate);
        Ok(())
    }

    /// One bounded pass; returns `true` once convergence is reached and the
    /// host should call `complete()` next.
    pub fn iterate(&mut self, stream: &mut SendStream) -> Result<bool, MigrationError> {
        stream.tick();
        let timer = Timer::now();
        let bytes_before = self.state.bytes_transferred;

        self.run_pass(stream, false)?;
        self.encoder.encode_eos(stream);
        if let Some(err) = stream.error() {
            self.transition(Phase::Cancelled);
            return Err(MigrationError::StreamIo(err.to_string()));
        }

        self.state.accounting.iterations += 1;

        let elapsed_s = (timer.elapsed_ms() / 1000.0).max(1e-9);
        let sent_this_pass = self.state.bytes_transferred - bytes_before;
        let mut bandwidth = sent_this_pass as f64 / elapsed_s;
        if bandwidth <= 0.0 {
            bandwidth = 1e-6;
        }
        self.state.last_bandwidth_bps = bandwidth;

        let dirty_pages = self.dirty.count();
        let mut expected_downtime_ns =
            (dirty_pages * PAGE_SIZE as u64) as f64 / bandwidth * 1e9;

        trace!(
            "migration: iteration {} dirty={} bw={:.0}B/s expected_downtime={:.0}ns",
            self.state.accounting.iterations,
            dirty_pages,
            bandwidth,
            expected_downtime_ns
        );

        if expected_downtime_ns as u64 <= self.config.max_downtime_ns {
            self.dirty.sync(&mut NoExternalDirtySource);
            let dirty_pages = self.dirty.count();
            expected_downtime_ns = (dirty_pages * PAGE_SIZE as u64) as f64 / bandwidth * 1e9;
            if expected_downtime_ns as u64 <= self.config.max_downtime_ns {
                debug!("migration: convergence reached, ready for stop-the-world flush");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Final sync and unrated flush of every remaining dirty page.
    pub fn complete(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        self.dirty.sync(&mut NoExternalDirtySource);
        self.run_pass(stream, true)?;
        self.encoder.encode_eos(stream);
        if let Some(err) = stream.error() {
            self.transition(Phase::Cancelled);
            return Err(MigrationError::StreamIo(err.to_string()));
        }
        self.dirty.disable_logging();
        if let Some(cache) = self.cache.as_mut() {
            cache.fini();
        }
        self.transition(Phase::Idle);
        Ok(())
    }

    /// Safe to call from any phase; idempotent.
    pub fn cancel(&mut self) {
        if self.state.phase == Phase::Idle {
            return;
        }
        warn!("migration: cancelled from {:?}", self.state.phase);
        self.dirty.disable_logging();
        if let Some(cache) = self.cache.as_mut() {
            cache.fini();
        }
        self.transition(Phase::Idle);
    }

    fn run_pass(&mut self, stream: &mut SendStream, ignore_rate_limit: bool) -> Result<(), MigrationError> {
        let total_pages = self.total_pages();
        if total_pages == 0 {
            return Ok(());
        }
        let timer = Timer::now();
        let mut examined = 0u64;
        let mut sub_steps = 0u64;

        while examined < total_pages {
            if !ignore_rate_limit && stream.rate_limited() {
                break;
            }

            let block_idx = self.state.cursor.block_idx;
            let offset = self.state.cursor.offset;
            let block_id = self.order[block_idx].id().to_string();

            if self.dirty.test(&block_id, offset, PAGE_SIZE as u64) {
                self.dirty.clear(&block_id, offset, PAGE_SIZE as u64);
                self.encode_dirty_page(stream, block_idx, &block_id, offset, ignore_rate_limit)?;
            }

            self.state.cursor.advance(&self.order);
            examined += 1;
            sub_steps += 1;

            if !ignore_rate_limit && sub_steps % 64 == 0 && timer.elapsed_ms() > self.config.max_wait_ms as f64 {
                trace!("migration: big wait, breaking after {sub_steps} sub-steps");
                break;
            }
        }
        Ok(())
    }

    fn encode_dirty_page(
        &mut self,
        stream: &mut SendStream,
        block_idx: usize,
        block_id: &str,
        offset: u64,
        is_final_flush: bool,
    ) -> Result<(), MigrationError> {
        let block = self.order[block_idx].clone();
        // SAFETY: `block` was registered by the caller and remains valid for
        // the lifetime of this driver; `offset` is page-aligned by
        // construction of the cursor.
        let page = unsafe { block.page(offset) };

        let bytes_before = stream.bytes_written();

        if let Some(value) = codec::is_single_repeated_byte(page) {
            self.encoder
                .encode(stream, block_id, offset, &PageRecord::ZeroRun { value });
            self.state.accounting.duplicate_pages += 1;
            self.state.bytes_transferred += stream.bytes_written() - bytes_before;
            return Ok(());
        }

        let guest_addr = block.guest_offset() + offset;

        if self.config.xbzrle_enabled {
            let page_copy = page.to_vec();
            let cache = self
                .cache
                .as_mut()
                .expect("cache initialized whenever xbzrle_enabled is true");

            if cache.probe(guest_addr) {
                let cached = cache.get(guest_addr).expect("probe just confirmed presence");
                match codec::xbzrle_encode(cached, &page_copy, PAGE_SIZE) {
                    XbzrleEncodeResult::Identical => {
                        // Dirty bit already cleared by the caller; nothing to send.
                    }
                    XbzrleEncodeResult::Overflow => {
                        cached.copy_from_slice(&page_copy);
                        self.encoder.encode(
                            stream,
                            block_id,
                            offset,
                            &PageRecord::Raw { bytes: page_copy },
                        );
                        self.state.accounting.xbzrle_overflows += 1;
                        self.state.accounting.raw_pages += 1;
                    }
                    XbzrleEncodeResult::Encoded(encoded) => {
                        let len = encoded.len() as u64;
                        self.encoder
                            .encode(stream, block_id, offset, &PageRecord::Xbzrle { encoded });
                        if !is_final_flush {
                            let cached = cache.get(guest_addr).expect("entry still present");
                            cached.copy_from_slice(&page_copy);
                        }
                        self.state.accounting.xbzrle_pages += 1;
                        self.state.accounting.xbzrle_bytes += len;
                    }
                }
                self.state.bytes_transferred += stream.bytes_written() - bytes_before;
                return Ok(());
            }

            cache.insert(guest_addr, &page_copy);
            self.state.accounting.xbzrle_cache_miss += 1;
            self.encoder.encode(
                stream,
                block_id,
                offset,
                &PageRecord::Raw { bytes: page_copy },
            );
            self.state.accounting.raw_pages += 1;
            self.state.bytes_transferred += stream.bytes_written() - bytes_before;
            return Ok(());
        }

        self.encoder.encode(
            stream,
            block_id,
            offset,
            &PageRecord::Raw {
                bytes: page.to_vec(),
            },
        );
        self.state.accounting.raw_pages += 1;
        self.state.bytes_transferred += stream.bytes_written() - bytes_before;
        Ok(())
    }

    /// Load-side mirror of the encoder. Validates the version word, the
    /// manifest's block identities and lengths, then applies each record.
    ///
    /// The wire carries one `FLAG_EOS` word per burst — one to close the
    /// manifest, one after every `iterate()` pass, one final one after
    /// `complete()` — all indistinguishable from each other as bare words.
    /// A burst boundary is not the end of the transfer: only a clean
    /// stream exhaustion immediately following an `FLAG_EOS` is. Any other
    /// read failure (exhaustion mid-record, or before the first `FLAG_EOS`
    /// is ever seen) is a genuine truncation and is rejected.
    pub fn load(&mut self, stream: &mut RecvStream, version_id: u32) -> Result<(), MigrationError> {
        if version_id != MIGRATION_STREAM_VERSION {
            return Err(MigrationError::InvalidStream(format!(
                "unsupported migration stream version {version_id}"
            )));
        }

        let mut last_was_eos = false;
        loop {
            match self.decoder.decode(stream) {
                Ok(DecodedRecord::Eos) => {
                    last_was_eos = true;
                }
                Ok(DecodedRecord::MemSize { total_bytes }) => {
                    self.validate_manifest(stream, total_bytes)?;
                    last_was_eos = false;
                }
                Ok(DecodedRecord::Page {
                    block_id,
                    offset,
                    record,
                }) => {
                    self.apply_loaded_page(&block_id, offset, record)?;
                    last_was_eos = false;
                }
                Err(err) => {
                    if last_was_eos {
                        return Ok(());
                    }
                    return Err(err);
                }
            }
        }
    }

    fn validate_manifest(
        &mut self,
        stream: &mut RecvStream,
        mut remaining_bytes: u64,
    ) -> Result<(), MigrationError> {
        while remaining_bytes > 0 {
            let len = stream.get_u8() as usize;
            let id_bytes = stream.get_bytes(len);
            let id = String::from_utf8(id_bytes).map_err(|_| {
                MigrationError::InvalidStream("manifest block id is not valid UTF-8".to_string())
            })?;
            let length = stream.get_be64();

            let block = self.registry.lookup_by_id(&id)?;
            if block.length() != length {
                return Err(MigrationError::InvalidStream(format!(
                    "block {id} length mismatch: manifest says {length}, local is {}",
                    block.length()
                )));
            }
            remaining_bytes = remaining_bytes.saturating_sub(length);
        }
        Ok(())
    }

    fn apply_loaded_page(
        &mut self,
        block_id: &str,
        offset: u64,
        record: PageRecord,
    ) -> Result<(), MigrationError> {
        let block = self.registry.lookup_by_id(block_id)?;
        // SAFETY: same invariant as `encode_dirty_page`: the block was
        // registered by the caller and `offset` is page-aligned.
        let dest = unsafe { block.page_mut(offset) };
        match record {
            PageRecord::ZeroRun { value } => {
                dest.fill(value);
                if value == 0 {
                    self.sink.discard(block_id, offset, PAGE_SIZE as u64);
                }
            }
            PageRecord::Raw { bytes } => {
                dest.copy_from_slice(&bytes);
            }
            PageRecord::Xbzrle { encoded } => {
                codec::xbzrle_decode(&encoded, dest)?;
            }
        }
        Ok(())
    }
}

impl SaveStateHandler for MigrationDriver {
    fn name(&self) -> &str {
        "ram"
    }

    fn setup(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        MigrationDriver::setup(self, stream)
    }

    fn iterate(&mut self, stream: &mut SendStream) -> Result<bool, MigrationError> {
        MigrationDriver::iterate(self, stream)
    }

    fn complete(&mut self, stream: &mut SendStream) -> Result<(), MigrationError> {
        MigrationDriver::complete(self, stream)
    }

    fn load(&mut self, stream: &mut RecvStream, version_id: u32) -> Result<(), MigrationError> {
        MigrationDriver::load(self, stream, version_id)
    }

    fn cancel(&mut self) {
        MigrationDriver::cancel(self)
    }
}
