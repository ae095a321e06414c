//! Tests for the HP 6626A driver.

use std::collections::VecDeque;

use measurements::{Current, Voltage};
use rstest::*;

use instrument_link::{InstrumentError, InstrumentInterface, LoopbackInterface};

use hp_6626a::*;

// Type alias for the loopback interface with the HP 6626A driver.
type Hp6626aLbk = Hp6626a<LoopbackInterface>;

/// Create a new HP 6626A instance that talks directly to the loopback interface.
fn crt_inst(host2inst: Vec<&str>, inst2host: Vec<&str>) -> Hp6626aLbk {
    let interface = LoopbackInterface::new(host2inst, inst2host, "\n");
    Hp6626a::new(interface)
}

/// Bridge preamble that is sent when creating an instrument behind a GPIB bridge at address 5.
const PREAMBLE: [&str; 5] = ["++mode 1", "++addr 5", "++auto 0", "++eoi 1", "++eos 2"];

/// Create a new HP 6626A instance behind a GPIB bridge at address 5.
fn crt_bridge_inst(host2inst: Vec<&str>, inst2host: Vec<&str>) -> Hp6626aLbk {
    let mut h2i = PREAMBLE.to_vec();
    h2i.extend(host2inst);
    let interface = LoopbackInterface::new(h2i, inst2host, "\n");
    Hp6626a::with_bridge(interface, 5).unwrap()
}

#[fixture]
fn emp_inst() -> Hp6626aLbk {
    crt_inst(vec![], vec![])
}

/// Empty initialization should always pass.
#[rstest]
fn test_initialization(emp_inst: Hp6626aLbk) {
    assert_eq!(emp_inst.num_channels(), 4);
}

#[rstest]
fn test_get_name() {
    let mut inst = crt_inst(vec!["ID?"], vec!["HP6626A"]);
    assert_eq!(inst.get_name().unwrap(), "HP6626A");
}

#[rstest]
fn test_get_error_and_clear() {
    let mut inst = crt_inst(vec!["ERR?", "CLR"], vec!["0"]);
    assert_eq!(inst.get_error().unwrap(), 0);
    inst.clear().unwrap();
}

/// Channels are numbered like the outputs on the front panel.
#[rstest]
fn test_get_channel(mut emp_inst: Hp6626aLbk) {
    for idx in 1..=4 {
        assert_eq!(emp_inst.get_channel(idx).unwrap().index(), idx);
    }
    for idx in [0, 5] {
        match emp_inst.get_channel(idx) {
            Err(InstrumentError::ChannelIndexOutOfRange { idx: i, nof_channels }) => {
                assert_eq!(i, idx);
                assert_eq!(nof_channels, 4);
            }
            _ => panic!("Expected ChannelIndexOutOfRange error"),
        }
    }
}

#[rstest]
#[case(1, 1.8, "VSET 1,1.8000")]
#[case(2, 5.0, "VSET 2,5.0000")]
#[case(3, 12.3456, "VSET 3,12.3456")]
#[case(4, 0.0, "VSET 4,0.0000")]
fn test_channel_set_voltage(#[case] ch: usize, #[case] volts: f64, #[case] cmd: &str) {
    let mut inst = crt_inst(vec![cmd], vec![]);
    let mut channel = inst.get_channel(ch).unwrap();
    channel.set_voltage(Voltage::from_volts(volts)).unwrap();
}

#[rstest]
#[case(1, 0.1, "ISET 1,0.1000")]
#[case(4, 0.5, "ISET 4,0.5000")]
fn test_channel_set_current_limit(#[case] ch: usize, #[case] amps: f64, #[case] cmd: &str) {
    let mut inst = crt_inst(vec![cmd], vec![]);
    let mut channel = inst.get_channel(ch).unwrap();
    channel.set_current_limit(Current::from_amperes(amps)).unwrap();
}

/// Nothing is sent if a value is out of range.
#[rstest]
#[case(1, 16.5)]
#[case(3, 50.5)]
#[case(2, -1.0)]
fn test_channel_set_voltage_out_of_range(
    mut emp_inst: Hp6626aLbk,
    #[case] ch: usize,
    #[case] volts: f64,
) {
    let mut channel = emp_inst.get_channel(ch).unwrap();
    match channel.set_voltage(Voltage::from_volts(volts)) {
        Err(InstrumentError::FloatValueOutOfRange { value, .. }) => assert_eq!(value, volts),
        _ => panic!("Expected FloatValueOutOfRange error"),
    }
}

#[rstest]
fn test_channel_set_current_limit_out_of_range(mut emp_inst: Hp6626aLbk) {
    let mut channel = emp_inst.get_channel(3).unwrap();
    assert!(channel.set_current_limit(Current::from_amperes(0.6)).is_err());
}

#[rstest]
fn test_channel_output() {
    let mut inst = crt_inst(vec!["OUT 2,1", "OUT? 2", "OUT 2,0", "OUT? 2"], vec!["1", "0"]);
    let mut channel = inst.get_channel(2).unwrap();
    channel.set_output_enabled(true).unwrap();
    assert!(channel.get_output_enabled().unwrap());
    channel.set_output_enabled(false).unwrap();
    assert!(!channel.get_output_enabled().unwrap());
}

#[rstest]
fn test_channel_measure() {
    let mut inst = crt_inst(vec!["VOUT? 1", "IOUT? 1"], vec!["5.0012", " 0.1020"]);
    let mut channel = inst.get_channel(1).unwrap();
    assert_eq!(channel.get_voltage().unwrap().as_volts(), 5.0012);
    assert_eq!(channel.get_current().unwrap().as_amperes(), 0.102);
}

#[rstest]
fn test_channel_programmed_values() {
    let mut inst = crt_inst(vec!["VSET? 3", "ISET? 3"], vec!["20.000", "0.2500"]);
    let mut channel = inst.get_channel(3).unwrap();
    assert_eq!(channel.get_programmed_voltage().unwrap().as_volts(), 20.0);
    assert_eq!(
        channel.get_programmed_current_limit().unwrap().as_amperes(),
        0.25
    );
}

/// A reply that is not a number is reported with the reply attached.
#[rstest]
fn test_channel_measure_parse_error() {
    let mut inst = crt_inst(vec!["VOUT? 1"], vec!["garbage"]);
    let mut channel = inst.get_channel(1).unwrap();
    match channel.get_voltage() {
        Err(InstrumentError::ResponseParseError(resp)) => assert_eq!(resp, "garbage"),
        _ => panic!("Expected ResponseParseError"),
    }
}

#[rstest]
fn test_raw_commands() {
    let mut inst = crt_inst(vec!["OUT 1,0", "VOUT? 4"], vec!["0.0000"]);
    inst.sendcmd("OUT 1,0").unwrap();
    assert_eq!(inst.query("VOUT? 4").unwrap(), "0.0000");
}

/// The bridge gets its preamble once and a read request after every query.
#[rstest]
fn test_bridge() {
    let mut inst = crt_bridge_inst(
        vec!["VSET 1,1.8000", "VOUT? 1", "++read eoi"],
        vec!["1.7998"],
    );
    let mut channel = inst.get_channel(1).unwrap();
    channel.set_voltage(Voltage::from_volts(1.8)).unwrap();
    assert_eq!(channel.get_voltage().unwrap().as_volts(), 1.7998);
}

#[rstest]
fn test_bridge_address_out_of_range() {
    let interface = LoopbackInterface::new(Vec::<&str>::new(), vec![], "\n");
    assert!(matches!(
        Hp6626a::with_bridge(interface, 31),
        Err(InstrumentError::IntValueOutOfRange { value: 31, .. })
    ));
}

#[rstest]
fn test_close(mut emp_inst: Hp6626aLbk) {
    emp_inst.close().unwrap();
    emp_inst.close().unwrap();
    let mut channel = emp_inst.get_channel(1).unwrap();
    assert!(matches!(
        channel.set_output_enabled(true),
        Err(InstrumentError::NotConnected)
    ));
}

/// A supply whose replies can be late: a late reply lands in the input buffer only once the read
/// waiting for it has timed out.
#[derive(Debug, Default)]
struct LateSupply {
    replies: VecDeque<(String, bool)>,
    inbox: VecDeque<u8>,
    held: Vec<u8>,
    line: Vec<u8>,
}

impl LateSupply {
    fn new(replies: Vec<(&str, bool)>) -> Self {
        LateSupply {
            replies: replies
                .into_iter()
                .map(|(reply, late)| (reply.to_string(), late))
                .collect(),
            ..Default::default()
        }
    }
}

impl InstrumentInterface for LateSupply {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        if self.inbox.len() < buf.len() {
            self.inbox.extend(self.held.drain(..));
            return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
        }
        for byte in buf.iter_mut() {
            *byte = self.inbox.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        for &byte in data {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            if self.line.ends_with(b"?") {
                let (reply, late) = self.replies.pop_front().expect("reply should be scripted");
                let bytes = format!("{reply}\n").into_bytes();
                if late {
                    self.held.extend(bytes);
                } else {
                    self.inbox.extend(bytes);
                }
            }
            self.line.clear();
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), InstrumentError> {
        self.inbox.clear();
        Ok(())
    }
}

/// A reply that arrives after its query timed out is discarded before the next query.
#[rstest]
fn test_late_reply_is_not_taken_for_the_next_query() {
    let mut inst = Hp6626a::new(LateSupply::new(vec![("5.0000", true), ("0.0500", false)]));
    let mut channel = inst.get_channel(1).unwrap();
    assert!(channel.get_voltage().unwrap_err().is_timeout());
    assert_eq!(channel.get_current().unwrap().as_amperes(), 0.05);
}

/// An unparsable line may be a late reply with the real one right behind it, so the pending
/// input is discarded as well.
#[rstest]
fn test_unexpected_reply_discards_pending_input() {
    let mut inst = Hp6626a::new(LateSupply::new(vec![
        ("garbage\n5.0000", false),
        ("0.0500", false),
        ("0.0400", false),
    ]));
    let mut channel = inst.get_channel(1).unwrap();
    assert!(matches!(
        channel.get_voltage(),
        Err(InstrumentError::ResponseParseError(_))
    ));
    assert_eq!(channel.get_current().unwrap().as_amperes(), 0.05);
    assert_eq!(channel.get_current().unwrap().as_amperes(), 0.04);
}

/// Ensure cloning an instrument and a channel works correctly.
#[rstest]
fn test_cloning(mut emp_inst: Hp6626aLbk) {
    let _ = emp_inst.clone();
    let ch_c = emp_inst.get_channel(2).unwrap();
    let _ = ch_c.clone();
}
