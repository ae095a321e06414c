use std::time::Duration;

use hp_6626a::{Hp6626a, SerialInterfaceHp6626a};
use measurements::{Current, Voltage};

fn main() {
    let port = "/dev/ttyUSB0";

    // Open the USB-to-GPIB bridge and address the supply at GPIB address 5.
    let interface =
        SerialInterfaceHp6626a::simple(port, 115200).expect("Failed to open serial port");
    let mut inst = Hp6626a::with_bridge(interface, 5).unwrap();
    inst.set_timeout(Duration::from_secs(1));
    println!("Instrument ID: {}", inst.get_name().unwrap());

    // Program output 1 to 3.3 V with a 100 mA limit and switch it on.
    let mut out1 = inst.get_channel(1).unwrap();
    out1.set_voltage(Voltage::from_volts(3.3)).unwrap();
    out1.set_current_limit(Current::from_amperes(0.1)).unwrap();
    out1.set_output_enabled(true).unwrap();

    // Read back what the output actually delivers.
    println!("Output 1 voltage: {:?}", out1.get_voltage());
    println!("Output 1 current: {:?}", out1.get_current());

    out1.set_output_enabled(false).unwrap();
    inst.close().unwrap();
}
