//! Per-board driver — owns one board's transport and `CommandCodec`, and
//! turns the protocol's raw opcodes into the higher-level `connect` /
//! `apply` / `arm` / `poll_ready` / `read_payload` surface the
//! [`crate::acquire::Acquirer`] drives.

use serde::{Deserialize, Serialize};

use crate::protocol::{self, ArmTriggerRequest, CommandCodec, FirmwareId, RegisterValue};
use crate::state::{BoardConfig, ChannelConfig};
use crate::transport::Transport;
use crate::{Error, Result};

/// Fixed per-board hardware limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardCaps {
    pub channels: usize,
    pub adc_rate_hz: f64,
    pub lvds_rate_hz: f64,
    pub samples_per_lvds: usize,
    pub depth_max: u32,
}

impl Default for BoardCaps {
    fn default() -> Self {
        BoardCaps {
            channels: 2,
            adc_rate_hz: 3.2e9,
            lvds_rate_hz: 4.0e8,
            samples_per_lvds: 8,
            depth_max: 1 << 20,
        }
    }
}

/// Gain/offset calibration table: one row per discrete gain step, giving
/// the code-domain slope and intercept used to turn the requested trigger
/// threshold (in volts) into a 12-bit ADC-code-space threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainCalibrationRow {
    pub gain_db: f32,
    pub slope_code_per_volt: f32,
    pub intercept_code: f32,
}

fn default_gain_table() -> Vec<GainCalibrationRow> {
    // Coarse attenuator steps; slope/intercept are nominal pending per-unit
    // factory calibration, and are StateStore-overridable in the meantime.
    vec![
        GainCalibrationRow { gain_db: -20.0, slope_code_per_volt: 40.96, intercept_code: 2048.0 },
        GainCalibrationRow { gain_db: -10.0, slope_code_per_volt: 129.6, intercept_code: 2048.0 },
        GainCalibrationRow { gain_db: 0.0, slope_code_per_volt: 409.6, intercept_code: 2048.0 },
        GainCalibrationRow { gain_db: 10.0, slope_code_per_volt: 1295.6, intercept_code: 2048.0 },
        GainCalibrationRow { gain_db: 20.0, slope_code_per_volt: 4096.0, intercept_code: 2048.0 },
    ]
}

fn nearest_gain_row(table: &[GainCalibrationRow], gain_db: f32) -> GainCalibrationRow {
    *table
        .iter()
        .min_by(|a, b| {
            (a.gain_db - gain_db).abs()
                .partial_cmp(&(b.gain_db - gain_db).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("gain table is never empty")
}

/// Converts a requested threshold in volts to a 12-bit trigger threshold
/// code: `code = round(slope * (value_v - offset_v) + intercept)`, clamped
/// to the ADC's signed 12-bit range.
pub fn trigger_threshold_code(row: &GainCalibrationRow, value_v: f32, offset_v: f32) -> i16 {
    let raw = row.slope_code_per_volt * (value_v - offset_v) + row.intercept_code;
    raw.round().clamp(-2048.0, 2047.0) as i16
}

/// Maps a requested gain in dB onto the single-byte DAC code space the
/// `SetFrontend` opcode carries (distinct from the 12-bit ADC-code-space
/// threshold above).
fn gain_code_u8(gain_db: f32) -> u8 {
    (((gain_db + 20.0) / 40.0) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Maps a requested offset in volts (±5 V front-end range) onto the
/// single-byte DAC code space the `SetFrontend` opcode carries.
fn offset_code_u8(offset_v: f32) -> u8 {
    (((offset_v + 5.0) / 10.0) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// One physical board: its transport, codec, cached capabilities, and the
/// mutable bits of state that live below the `StateStore` (connection
/// status, desync bookkeeping) rather than in it.
pub struct Board {
    pub index: usize,
    pub caps: BoardCaps,
    transport: Box<dyn Transport>,
    codec: CommandCodec,
    gain_table: Vec<GainCalibrationRow>,
    pub connected: bool,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("index", &self.index)
            .field("caps", &self.caps)
            .field("connected", &self.connected)
            .field("transport", &self.transport.description())
            .finish()
    }
}

/// The subset of [`Board`]'s behavior the [`crate::acquire::Acquirer`]
/// drives. Extracted as a trait so the scheduler can be tested against a
/// fake without a real transport underneath.
pub trait BoardDriver {
    fn connect(&mut self) -> Result<()>;
    fn apply(&mut self, channels: &[ChannelConfig], board_cfg: &BoardConfig) -> Result<()>;
    fn arm(&mut self, board_cfg: &BoardConfig) -> Result<()>;
    fn poll_ready(&mut self) -> Result<bool>;
    fn read_payload(&mut self, byte_len: usize) -> Result<Vec<u8>>;
    fn set_phase(&mut self, pll_id: u8, output_id: u8, direction: i8) -> Result<()>;
    fn caps(&self) -> BoardCaps;
    /// Reads one LVDS phase counter register, used only by
    /// [`crate::lvds::LvdsCalibrator`].
    fn read_phase_counter(&mut self, register: u8) -> Result<u16>;
}

impl Board {
    pub fn new(index: usize, transport: Box<dyn Transport>, caps: BoardCaps) -> Board {
        Board {
            index,
            caps,
            transport,
            codec: CommandCodec::new(),
            gain_table: default_gain_table(),
            connected: false,
        }
    }

    fn send_and_recv(&mut self, frame: protocol::Frame) -> Result<[u8; 4]> {
        self.transport.write_all(&frame)?;
        let mut reply = [0u8; 4];
        self.transport.read_exact(&mut reply)?;
        Ok(reply)
    }

    /// Sends `frame` and decodes the reply with `decode`. On the first
    /// desync, flushes the transport and reissues `GetId` once before
    /// retrying `frame`; a second consecutive desync is left to bubble up
    /// as fatal.
    fn roundtrip<T>(
        &mut self,
        frame: protocol::Frame,
        seq: u8,
        decode: impl Fn(&mut CommandCodec, usize, u8, &[u8; 4]) -> Result<T>,
    ) -> Result<T> {
        let reply = self.send_and_recv(frame)?;
        match decode(&mut self.codec, self.index, seq, &reply) {
            Ok(value) => Ok(value),
            Err(Error::ProtocolDesync { .. }) if !self.codec.desync_is_fatal() => {
                self.transport.flush_input()?;
                let (id_frame, id_seq) = self.codec.encode_get_id();
                let id_reply = self.send_and_recv(id_frame)?;
                self.codec.decode_get_id(self.index, id_seq, &id_reply)?;
                let reply = self.send_and_recv(frame)?;
                decode(&mut self.codec, self.index, seq, &reply)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes one SPI byte, then reads it back to confirm, retrying up to
    /// 3 times on mismatch.
    fn write_spi_confirmed(&mut self, bus: u8, addr: u8, val: u8) -> Result<()> {
        for attempt in 0..3 {
            let (write_frame, _seq) = self.codec.encode_write_spi(bus, addr, val);
            self.transport.write_all(&write_frame)?;

            let (read_frame, seq) = self.codec.encode_read_register(addr);
            let reply = self.send_and_recv(read_frame)?;
            match self.codec.decode_register(self.index, seq, &reply) {
                Ok(RegisterValue { byte0, .. }) if byte0 == val => return Ok(()),
                Ok(RegisterValue { byte0, .. }) => {
                    log::debug!(
                        "board {}: SPI readback mismatch on attempt {} (bus {}, addr {}): wrote {}, read {}",
                        self.index, attempt, bus, addr, val, byte0
                    );
                }
                Err(e) => {
                    log::debug!("board {}: SPI readback failed on attempt {}: {}", self.index, attempt, e);
                }
            }
        }
        Err(Error::ProtocolDesync {
            board: self.index,
            detail: format!("SPI write to bus {} addr {} did not confirm after 3 attempts", bus, addr),
        })
    }
}

impl BoardDriver for Board {
    fn connect(&mut self) -> Result<()> {
        self.transport.flush_input()?;
        let (frame, seq) = self.codec.encode_get_id();
        let id: FirmwareId = self.roundtrip(frame, seq, CommandCodec::decode_get_id)?;
        log::info!(
            "board {}: connected, firmware {}.{}",
            self.index, id.version_major, id.version_minor
        );
        self.connected = true;
        Ok(())
    }

    fn apply(&mut self, channels: &[ChannelConfig], board_cfg: &BoardConfig) -> Result<()> {
        for (lane, channel) in channels.iter().enumerate() {
            let gain_frame = self.codec.encode_set_gain(lane as u8, gain_code_u8(channel.gain_db));
            self.transport.write_all(&gain_frame)?;
            let offset_frame = self.codec.encode_set_offset(lane as u8, offset_code_u8(channel.offset_v));
            self.transport.write_all(&offset_frame)?;
            let impedance_frame = self.codec.encode_set_impedance(lane as u8, channel.impedance == crate::state::Impedance::Ohm50);
            self.transport.write_all(&impedance_frame)?;
            let coupling_frame = self.codec.encode_set_coupling(lane as u8, channel.coupling == crate::state::Coupling::AC);
            self.transport.write_all(&coupling_frame)?;
        }

        let interleaved = board_cfg.channel_mode == crate::state::ChannelMode::SingleInterleaved;
        for lane in 0..channels.len() {
            let frame = self.codec.encode_set_oversample_interleave(
                lane as u8, board_cfg.oversample_with_neighbor, interleaved,
            );
            self.transport.write_all(&frame)?;
        }
        Ok(())
    }

    fn arm(&mut self, board_cfg: &BoardConfig) -> Result<()> {
        // The threshold codes use the nominal 0 dB row; per-channel gain is
        // already baked into the front end by `apply` before arming.
        let row = nearest_gain_row(&self.gain_table, 0.0);
        let request = ArmTriggerRequest {
            trigger_type: board_cfg.trigger_type as u8,
            trigger_channel: board_cfg.trigger_channel,
            threshold_upper_code: trigger_threshold_code(&row, 0.2, 0.0),
            threshold_lower_code: trigger_threshold_code(&row, -0.2, 0.0),
            tot_samples: board_cfg.tot_samples,
            trigger_delay: board_cfg.trigger_delay,
            holdoff: board_cfg.holdoff,
            prelength: board_cfg.prelength,
            length: board_cfg.length,
            downsample_exp: board_cfg.downsample_exp,
            downsample_merging: board_cfg.downsample_merging,
            first_last: board_cfg.first_last_role as u8,
            rolling: board_cfg.rolling_trigger_on,
        };
        let (frames, seq) = self.codec.encode_arm_trigger(request);
        for f in &frames[..frames.len() - 1] {
            self.transport.write_all(f)?;
        }
        let last = frames[frames.len() - 1];
        self.roundtrip(last, seq, |codec, b, s, buf| codec.decode_arm_status(b, s, buf).map(|_| ()))
    }

    fn poll_ready(&mut self) -> Result<bool> {
        let (frame, seq) = self.codec.encode_poll_status();
        let status = self.roundtrip(frame, seq, CommandCodec::decode_arm_status)?;
        Ok(status.acqstate == protocol::ACQSTATE_READY_TO_READ)
    }

    fn read_payload(&mut self, byte_len: usize) -> Result<Vec<u8>> {
        let (frame, _seq) = self.codec.encode_bulk_read(byte_len as u32);
        self.transport.write_all(&frame)?;
        let mut payload = vec![0u8; byte_len];
        self.transport.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn set_phase(&mut self, pll_id: u8, output_id: u8, direction: i8) -> Result<()> {
        let frame = self.codec.encode_phase_adjust(pll_id, output_id, direction);
        self.transport.write_all(&frame)?;
        Ok(())
    }

    fn caps(&self) -> BoardCaps {
        self.caps
    }

    fn read_phase_counter(&mut self, register: u8) -> Result<u16> {
        let (frame, seq) = self.codec.encode_read_register(register);
        let value = self.roundtrip(frame, seq, CommandCodec::decode_register)?;
        Ok(u16::from_be_bytes([value.byte0, value.byte1]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nearest_gain_row_picks_closest() {
        let table = default_gain_table();
        let row = nearest_gain_row(&table, 3.0);
        assert_eq!(row.gain_db, 0.0);
    }

    #[test]
    fn test_trigger_threshold_code_clamps_to_12_bit_range() {
        let row = GainCalibrationRow { gain_db: 0.0, slope_code_per_volt: 1.0e6, intercept_code: 0.0 };
        let code = trigger_threshold_code(&row, 1.0, 0.0);
        assert_eq!(code, 2047);
    }

    #[test]
    fn test_gain_and_offset_code_clamp_to_byte_range() {
        assert_eq!(gain_code_u8(100.0), 255);
        assert_eq!(gain_code_u8(-100.0), 0);
        assert_eq!(offset_code_u8(100.0), 255);
    }

    #[test]
    fn test_connect_roundtrip_with_stub() {
        use crate::transport::stub::StubTransport;
        let mut stub = StubTransport::new("board_0");
        // GetId reply: [op_echo=0, seq<<4, version_major=1, version_minor=2]
        stub.push_reply(&[0, 0x00, 1, 2]);
        let mut board = Board::new(0, Box::new(stub), BoardCaps::default());
        board.connect().unwrap();
        assert!(board.connected);
    }

    #[test]
    fn test_connect_resyncs_once_then_fails_on_second_desync() {
        use crate::transport::stub::StubTransport;
        let mut stub = StubTransport::new("board_0");
        // first GetId reply: desynced opcode
        stub.push_reply(&[0xff, 0x00, 0, 0]);
        // resync GetId reply: good
        stub.push_reply(&[0, 0x10, 1, 2]);
        // retried original GetId reply: still desynced -> fatal
        stub.push_reply(&[0xff, 0x00, 0, 0]);
        let mut board = Board::new(0, Box::new(stub), BoardCaps::default());
        assert!(board.connect().is_err());
    }
}
