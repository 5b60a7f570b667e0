//! Central configuration store — the only mutable shared state in the
//! system. Everything downstream of `cycle_begin` sees an immutable
//! [`StateSnapshot`], never the live store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::board::BoardCaps;
use crate::fir::FirBank;
use crate::lvds::LvdsCalibrationSet;
use crate::{ConfigKind, Error, Result};

/// The current `.hsp`/`.fir`/`.cal` schema version this build writes.
/// Loaders accept this version or any older one, migrating forward.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Coupling {
    #[default]
    DC,
    AC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Impedance {
    Ohm50,
    #[default]
    Ohm1M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Bandwidth {
    #[default]
    Full,
    MHz20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerType {
    #[default]
    Disabled,
    Rising,
    Falling,
    ExtIn,
    Auto,
    ExtSma,
    ExtEcho,
}

impl TriggerType {
    /// Trigger types that designate a board as "the" synchronized source
    /// (exactly one board may hold one of these at a time).
    pub fn is_source_candidate(self) -> bool {
        matches!(self, Self::Rising | Self::Falling | Self::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChannelMode {
    #[default]
    Dual,
    SingleInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FirstLastRole {
    #[default]
    Only,
    First,
    Middle,
    Last,
}

/// Per physical channel (N = 2 · num_boards).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub gain_db: f32,
    pub offset_v: f32,
    pub coupling: Coupling,
    pub impedance: Impedance,
    pub bandwidth_limit: Bandwidth,
    pub persist_on: bool,
    pub peak_detect_on: bool,
    pub resamp_factor: u8,
    pub reference_slot: Option<usize>,
    pub color_id: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            gain_db: 0.0,
            offset_v: 0.0,
            coupling: Coupling::default(),
            impedance: Impedance::default(),
            bandwidth_limit: Bandwidth::default(),
            persist_on: false,
            peak_detect_on: false,
            resamp_factor: 1,
            reference_slot: None,
            color_id: 0,
        }
    }
}

/// Per board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub trigger_type: TriggerType,
    pub trigger_channel: u8,
    pub threshold_upper_code: i16,
    pub threshold_lower_code: i16,
    pub tot_samples: u16,
    pub trigger_delay: u16,
    pub holdoff: u16,
    pub prelength: u16,
    pub length: u32,
    pub downsample_exp: u8,
    pub downsample_merging: u8,
    pub channel_mode: ChannelMode,
    pub oversample_with_neighbor: bool,
    pub rolling_trigger_on: bool,
    pub first_last_role: FirstLastRole,
    pub lvds_delay_cycles: f32,
    pub pll_reset_pending: bool,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            trigger_type: TriggerType::default(),
            trigger_channel: 0,
            threshold_upper_code: 0,
            threshold_lower_code: 0,
            tot_samples: 0,
            trigger_delay: 0,
            holdoff: 0,
            prelength: 0,
            length: 1000,
            downsample_exp: 0,
            downsample_merging: 1,
            channel_mode: ChannelMode::default(),
            oversample_with_neighbor: false,
            rolling_trigger_on: false,
            first_last_role: FirstLastRole::default(),
            lvds_delay_cycles: 0.0,
            pll_reset_pending: false,
        }
    }
}

/// Session-wide settings that are neither per-channel nor per-board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub acquisition_timeout_ms: u64,
    pub drop_on_overrun: bool,
    /// Gates the per-cycle "extra" trigger stabilizer stage in the
    /// Corrector, independent of the always-on board-level stabilizer.
    /// Default on.
    pub extra_trigger_stabilizer_on: bool,
    /// Tuning factor for the backward-echo LVDS delay correction; origin
    /// of the default is unclear, kept as a field rather than a literal
    /// so a hardware revision can override it.
    pub lvds_backward_tuning_factor: f32,
    /// Systematic per-board-pair offset subtracted from every follower's
    /// measured LVDS delay.
    pub lvds_systematic_offset_ns: f32,
    pub unstable_ordering: bool,
    pub testing_mode: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            acquisition_timeout_ms: 1000,
            drop_on_overrun: false,
            extra_trigger_stabilizer_on: true,
            lvds_backward_tuning_factor: 11.5,
            lvds_systematic_offset_ns: 16.0,
            unstable_ordering: false,
            testing_mode: false,
        }
    }
}

/// The central, single-writer configuration structure. `StateStore` is
/// plain data; every invariant-checking mutation goes through a method
/// on this type (`set_*`) that validates before committing, never
/// partially applying a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStore {
    pub schema_version: u32,
    pub channels: Vec<ChannelConfig>,
    pub boards: Vec<BoardConfig>,
    pub board_caps: Vec<BoardCaps>,
    pub global: GlobalConfig,
    pub fir: FirBank,
    pub lvds: LvdsCalibrationSet,
}

/// An immutable, cheaply-clonable view of the store captured at
/// `cycle_begin`. Implemented as a plain `Arc` clone since the store
/// is small relative to waveform data — there is no need for a
/// structural diff/COW scheme.
pub type StateSnapshot = Arc<StateStore>;

impl StateStore {
    /// Construct a store for `num_boards` boards (2 channels each).
    pub fn new(num_boards: usize) -> StateStore {
        let mut store = StateStore {
            schema_version: CURRENT_SCHEMA_VERSION,
            channels: vec![ChannelConfig::default(); num_boards * 2],
            boards: vec![BoardConfig::default(); num_boards],
            board_caps: vec![BoardCaps::default(); num_boards],
            global: GlobalConfig::default(),
            fir: FirBank::default(),
            lvds: LvdsCalibrationSet::default(),
        };
        store.recompute_first_last_roles();
        if let Some(first_source) = store.boards.iter().position(|b| b.trigger_type.is_source_candidate()) {
            let _ = first_source; // already consistent; nothing to force
        } else if !store.boards.is_empty() {
            store.boards[0].trigger_type = TriggerType::Auto;
        }
        store
    }

    pub fn num_boards(&self) -> usize {
        self.boards.len()
    }

    pub fn snapshot(self: &Arc<Self>) -> StateSnapshot {
        Arc::clone(self)
    }

    /// Board 0 is `first`, board N-1 is `last`, the rest are `middle`;
    /// if there is only one board its role is `only`. Called after any
    /// change to board count.
    pub fn recompute_first_last_roles(&mut self) {
        let n = self.boards.len();
        for (i, board) in self.boards.iter_mut().enumerate() {
            board.first_last_role = if n <= 1 {
                FirstLastRole::Only
            } else if i == 0 {
                FirstLastRole::First
            } else if i == n - 1 {
                FirstLastRole::Last
            } else {
                FirstLastRole::Middle
            };
        }
    }

    fn check_board_index(&self, index: usize) -> Result<()> {
        if index >= self.boards.len() {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::BoardIndex,
                detail: format!("board index {} out of range (have {})", index, self.boards.len()),
            });
        }
        Ok(())
    }

    fn check_channel_index(&self, index: usize) -> Result<()> {
        if index >= self.channels.len() {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::ChannelIndex,
                detail: format!("channel index {} out of range (have {})", index, self.channels.len()),
            });
        }
        Ok(())
    }

    /// Set a board's trigger type, enforcing that at most one board is a
    /// synchronized trigger source: any other board currently holding a
    /// source-candidate type is forced to `ExtIn`.
    pub fn set_trigger_type(&mut self, board: usize, trigger_type: TriggerType) -> Result<()> {
        self.check_board_index(board)?;
        if trigger_type.is_source_candidate() && self.boards.len() > 1 {
            for (i, other) in self.boards.iter_mut().enumerate() {
                if i != board && other.trigger_type.is_source_candidate() {
                    other.trigger_type = TriggerType::ExtIn;
                }
            }
        }
        self.boards[board].trigger_type = trigger_type;
        Ok(())
    }

    /// When `oversample_with_neighbor[k] == true`, `k` must be even and
    /// both `k` and `k + 1` observe identical trigger settings.
    pub fn set_oversample_with_neighbor(&mut self, k: usize, enabled: bool) -> Result<()> {
        self.check_board_index(k)?;
        if enabled {
            if k % 2 != 0 {
                return Err(Error::InvalidConfig {
                    kind: ConfigKind::OversamplePairing,
                    detail: format!("oversample_with_neighbor requires an even board index, got {}", k),
                });
            }
            self.check_board_index(k + 1)?;
            let partner = self.boards[k + 1];
            let this = &mut self.boards[k];
            this.oversample_with_neighbor = true;
            this.trigger_type = partner.trigger_type;
            this.trigger_channel = partner.trigger_channel;
            self.boards[k + 1].oversample_with_neighbor = true;
        } else {
            self.boards[k].oversample_with_neighbor = false;
            if k + 1 < self.boards.len() {
                self.boards[k + 1].oversample_with_neighbor = false;
            }
        }
        Ok(())
    }

    pub fn set_downsample(&mut self, board: usize, exp: u8, merging: u8) -> Result<()> {
        self.check_board_index(board)?;
        if exp > 28 {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::SampleRate,
                detail: format!("downsample_exp {} exceeds the 0..28 range", exp),
            });
        }
        self.boards[board].downsample_exp = exp;
        self.boards[board].downsample_merging = merging.max(1);
        Ok(())
    }

    pub fn set_channel_resamp_factor(&mut self, channel: usize, factor: u8) -> Result<()> {
        self.check_channel_index(channel)?;
        if !matches!(factor, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::ResampleFactor,
                detail: format!("resamp_factor must be one of 1, 2, 4, 8, got {}", factor),
            });
        }
        self.channels[channel].resamp_factor = factor;
        Ok(())
    }

    pub fn set_channel_gain(&mut self, channel: usize, gain_db: f32) -> Result<()> {
        self.check_channel_index(channel)?;
        self.channels[channel].gain_db = gain_db;
        Ok(())
    }

    pub fn set_channel_reference_slot(&mut self, channel: usize, slot: Option<usize>, num_slots: usize) -> Result<()> {
        self.check_channel_index(channel)?;
        if let Some(s) = slot {
            if s >= num_slots {
                return Err(Error::InvalidConfig {
                    kind: ConfigKind::ReferenceSlot,
                    detail: format!("reference slot {} out of range (have {})", s, num_slots),
                });
            }
        }
        self.channels[channel].reference_slot = slot;
        Ok(())
    }

    /// `sample_rate_hz = adc_rate_hz / 2^downsample_exp / downsample_merging`.
    pub fn sample_rate_hz(&self, board: usize) -> f64 {
        let caps = &self.board_caps[board];
        let cfg = &self.boards[board];
        let base = caps.adc_rate_hz / (1u64 << cfg.downsample_exp as u32) as f64;
        let base = base / cfg.downsample_merging.max(1) as f64;
        // Interleaved channel mode doubles the effective rate (two ADCs
        // feed one logical input).
        if cfg.channel_mode == ChannelMode::SingleInterleaved { base * 2.0 } else { base }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<StateStore> {
        let file = std::fs::File::open(path)?;
        let raw: serde_json::Value = serde_json::from_reader(file)?;
        Self::load_from_value(raw)
    }

    /// Parses a `.hsp` JSON document, migrating legacy (pre-array,
    /// single-value) fields forward by repeating them across the
    /// per-channel/per-board arrays.
    fn load_from_value(raw: serde_json::Value) -> Result<StateStore> {
        let schema_version = raw.get("schema_version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        if schema_version > CURRENT_SCHEMA_VERSION {
            return Err(Error::InvalidConfig {
                kind: ConfigKind::SchemaVersion,
                detail: format!(
                    "file schema version {} is newer than this build ({})",
                    schema_version, CURRENT_SCHEMA_VERSION
                ),
            });
        }
        if schema_version == CURRENT_SCHEMA_VERSION {
            let mut store: StateStore = serde_json::from_value(raw)?;
            store.schema_version = CURRENT_SCHEMA_VERSION;
            return Ok(store);
        }
        migrate_legacy(raw)
    }
}

/// Schema version 0 carried single scalar fields instead of per-channel/
/// per-board arrays (e.g. one `gain_db` for the whole instrument). This
/// expands those into arrays by repetition, matching every current
/// channel/board, then re-parses as the current schema.
fn migrate_legacy(mut raw: serde_json::Value) -> Result<StateStore> {
    let obj = raw.as_object_mut().ok_or_else(|| Error::InvalidConfig {
        kind: ConfigKind::SchemaVersion,
        detail: "legacy state file is not a JSON object".to_string(),
    })?;

    let num_boards = obj.get("boards")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(1);

    if !matches!(obj.get("channels"), Some(serde_json::Value::Array(_))) {
        let legacy_channel: HashMap<String, serde_json::Value> = obj
            .iter()
            .filter(|(k, _)| k.starts_with("channel_"))
            .map(|(k, v)| (k.trim_start_matches("channel_").to_string(), v.clone()))
            .collect();
        let mut channel = serde_json::to_value(ChannelConfig::default())?;
        if let serde_json::Value::Object(ref mut map) = channel {
            for (k, v) in legacy_channel {
                map.insert(k, v);
            }
        }
        let channels: Vec<serde_json::Value> = (0..num_boards * 2).map(|_| channel.clone()).collect();
        obj.insert("channels".to_string(), serde_json::Value::Array(channels));
    }
    if !matches!(obj.get("boards"), Some(serde_json::Value::Array(_))) {
        let board = serde_json::to_value(BoardConfig::default())?;
        obj.insert("boards".to_string(), serde_json::Value::Array(vec![board]));
    }
    obj.entry("board_caps").or_insert_with(|| {
        serde_json::Value::Array(vec![serde_json::to_value(BoardCaps::default()).unwrap(); num_boards.max(1)])
    });
    obj.entry("global").or_insert_with(|| serde_json::to_value(GlobalConfig::default()).unwrap());
    obj.entry("fir").or_insert_with(|| serde_json::to_value(FirBank::default()).unwrap());
    obj.entry("lvds").or_insert_with(|| serde_json::to_value(LvdsCalibrationSet::default()).unwrap());
    obj.insert("schema_version".to_string(), serde_json::Value::from(CURRENT_SCHEMA_VERSION));

    let mut store: StateStore = serde_json::from_value(raw)?;
    store.recompute_first_last_roles();
    Ok(store)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_last_roles_single_board() {
        let store = StateStore::new(1);
        assert_eq!(store.boards[0].first_last_role, FirstLastRole::Only);
    }

    #[test]
    fn test_first_last_roles_multi_board() {
        let store = StateStore::new(3);
        assert_eq!(store.boards[0].first_last_role, FirstLastRole::First);
        assert_eq!(store.boards[1].first_last_role, FirstLastRole::Middle);
        assert_eq!(store.boards[2].first_last_role, FirstLastRole::Last);
    }

    #[test]
    fn test_single_trigger_source_enforced() {
        let mut store = StateStore::new(2);
        store.set_trigger_type(0, TriggerType::Rising).unwrap();
        store.set_trigger_type(1, TriggerType::Falling).unwrap();
        assert_eq!(store.boards[0].trigger_type, TriggerType::ExtIn);
        assert_eq!(store.boards[1].trigger_type, TriggerType::Falling);
    }

    #[test]
    fn test_oversample_pairing_requires_even_index() {
        let mut store = StateStore::new(2);
        assert!(store.set_oversample_with_neighbor(1, true).is_err());
        assert!(store.set_oversample_with_neighbor(0, true).is_ok());
        assert_eq!(store.boards[0].trigger_type, store.boards[1].trigger_type);
    }

    #[test]
    fn test_downsample_exp_out_of_range_rejected() {
        let mut store = StateStore::new(1);
        assert!(store.set_downsample(0, 29, 1).is_err());
        assert!(store.set_downsample(0, 28, 1).is_ok());
    }

    #[test]
    fn test_resamp_factor_must_be_power_of_two_in_range() {
        let mut store = StateStore::new(1);
        assert!(store.set_channel_resamp_factor(0, 3).is_err());
        assert!(store.set_channel_resamp_factor(0, 4).is_ok());
    }

    #[test]
    fn test_sample_rate_computation() {
        let mut store = StateStore::new(1);
        store.set_downsample(0, 1, 2).unwrap();
        let rate = store.sample_rate_hz(0);
        assert!((rate - 3.2e9 / 2.0 / 2.0).abs() < 1.0);
    }

    #[test]
    fn test_interleaved_doubles_effective_rate() {
        let mut store = StateStore::new(1);
        store.boards[0].channel_mode = ChannelMode::SingleInterleaved;
        let rate = store.sample_rate_hz(0);
        assert!((rate - 3.2e9 * 2.0).abs() < 1.0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("haasoscope_test_state_{}.hsp", std::process::id()));
        let mut store = StateStore::new(2);
        store.set_channel_gain(0, 12.5).unwrap();
        store.save(&path).unwrap();
        let loaded = StateStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        std::fs::remove_file(&path).ok();
    }
}
