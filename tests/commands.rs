use behavcam::command::{
    encode_change, encode_init, parse_token, resolve, resolve_all, Placeholder, Protocol,
    RawCommand, Token,
};
use behavcam::{CommandError, DeviceRegistry};

const DEVICES: &str = r#"{
    "MiniCAM": {
        "width": 1024, "height": 768,
        "controlSettings": {
            "gain": {
                "startValue": 1,
                "sendCommand": [
                    {"protocol": "I2C", "addressW": "0b10111010", "regLength": 1, "reg0": "0x35",
                     "dataLength": 2, "data0": "valueH", "data1": "valueL"},
                    {"protocol": "SPI", "addressW": "0x10", "regLength": 0,
                     "dataLength": 1, "data0": "valueL"}
                ]
            }
        },
        "initialize": [
            {"protocol": "I2C", "addressW": "0xC0", "regLength": 1, "reg0": "0x1F",
             "dataLength": 1, "data0": "0b00010001"},
            {"protocol": "I2C", "addressW": "0xB0", "regLength": 2, "reg0": "0x05", "reg1": 3,
             "dataLength": 2, "data0": "0x20", "data1": 7},
            {"protocol": "I2C", "addressW": "0xB0", "regLength": 1, "reg0": "0x06",
             "dataLength": 1, "data0": "bogus"},
            {"protocol": "I2C", "regLength": 1, "reg0": "0x06"},
            {"protocol": "I2C", "addressW": "0xB0", "reg0": "0x07", "dataLength": 1, "data0": 300},
            {"protocol": "I2C", "addressW": "0x98", "regLength": 1, "reg0": "0x00"}
        ]
    }
}"#;

fn commands(json: &str) -> Vec<RawCommand> {
    serde_json::from_str(json).unwrap()
}

#[test]
fn token_precedence() {
    assert_eq!(parse_token("0xFF"), Token::Number(255));
    assert_eq!(parse_token("0b1010"), Token::Number(10));
    assert_eq!(parse_token("12"), Token::Number(12));
    assert_eq!(parse_token("I2C"), Token::Protocol(Protocol::I2c));
    assert_eq!(parse_token("value2L"), Token::Placeholder(Placeholder::Value2L));
    assert_eq!(parse_token(""), Token::Error);
    assert_eq!(parse_token("bogus"), Token::Error);
}

#[test]
fn bad_entries_do_not_block_siblings() {
    let registry = DeviceRegistry::from_json(DEVICES).unwrap();
    let device = registry.get("MiniCAM").unwrap();

    let resolved = resolve(&device.initialize);
    assert_eq!(resolved.len(), 6);
    assert!(resolved[0].is_ok());
    assert!(resolved[1].is_ok());
    // Unknown symbol: resolved, but refused at encode time
    assert!(resolved[2].is_ok());
    // Missing addressW
    assert!(matches!(
        resolved[3],
        Err(CommandError::Configuration { index: 3, .. })
    ));
    // Literal wider than a byte
    assert!(matches!(
        resolved[4],
        Err(CommandError::Configuration { index: 4, .. })
    ));
    assert!(resolved[5].is_ok());

    assert_eq!(resolve_all("MiniCAM initialize", &device.initialize).len(), 4);
}

#[test]
fn init_packets_are_addressed_and_sized() {
    let registry = DeviceRegistry::from_json(DEVICES).unwrap();
    let device = registry.get("MiniCAM").unwrap();

    let packets: Vec<_> = resolve_all("init", &device.initialize)
        .iter()
        .filter_map(|t| encode_init(t).ok().map(|p| (t.clone(), p)))
        .collect();
    assert_eq!(packets.len(), 3);

    for (template, packet) in &packets {
        assert_eq!(packet.len(), 1 + template.reg_length() + template.data_length());
    }

    assert_eq!(packets[0].1.bytes, [0xC0, 0x1F, 0x11]);
    assert_eq!(packets[0].1.address_key, 0xC01F);
    assert_eq!(packets[1].1.bytes, [0xB0, 0x05, 0x03, 0x20, 0x07]);
    assert_eq!(packets[1].1.address_key, 0xB0_05_03);
    // No data bytes at all
    assert_eq!(packets[2].1.bytes, [0x98, 0x00]);
}

#[test]
fn invalid_symbol_never_reaches_the_bus() {
    let templates = resolve_all(
        "test",
        &commands(
            r#"[{"protocol": "I2C", "addressW": "0xB0", "regLength": 1, "reg0": "0x06",
                 "dataLength": 1, "data0": "bogus"}]"#,
        ),
    );
    assert!(matches!(
        encode_init(&templates[0]),
        Err(CommandError::InvalidField { index: 0, .. })
    ));
    assert!(encode_change(&templates[0], 1.0, 0.0).is_err());
}

#[test]
fn control_change_substitutes_runtime_values() {
    let registry = DeviceRegistry::from_json(DEVICES).unwrap();
    let device = registry.get("MiniCAM").unwrap();
    let gain = resolve_all("gain", &device.control_settings["gain"].send_command);

    let packet = encode_change(&gain[0], 0x1234 as f64, 0.0).unwrap();
    assert_eq!(packet.bytes, [0xBA, 0x35, 0x12, 0x34]);

    // Half rounds away from zero
    let packet = encode_change(&gain[0], 2.5, 0.0).unwrap();
    assert_eq!(packet.bytes, [0xBA, 0x35, 0x00, 0x03]);

    // Placeholders cannot be sent as startup defaults
    assert!(matches!(
        encode_init(&gain[0]),
        Err(CommandError::UnresolvedPlaceholder { index: 0 })
    ));

    assert!(matches!(
        encode_change(&gain[1], 1.0, 0.0),
        Err(CommandError::UnsupportedProtocol(Protocol::Spi))
    ));
}

#[test]
fn address_key_ignores_data_bytes() {
    let registry = DeviceRegistry::from_json(DEVICES).unwrap();
    let device = registry.get("MiniCAM").unwrap();
    let gain = resolve_all("gain", &device.control_settings["gain"].send_command);

    let keys: Vec<u64> = [0.0, 1.0, 255.0, 4096.0, 65535.0]
        .iter()
        .map(|&v| encode_change(&gain[0], v, 0.0).unwrap().address_key)
        .collect();
    assert!(keys.iter().all(|&k| k == 0xBA35));
}

#[test]
fn wide_values_use_all_four_bytes() {
    let templates = resolve_all(
        "exposure",
        &commands(
            r#"[{"protocol": "I2C", "addressW": "0x20", "regLength": 1, "reg0": "0x01",
                 "dataLength": 6, "data0": "valueH24", "data1": "valueH16", "data2": "valueH",
                 "data3": "valueL", "data4": "value2H", "data5": "value2L"}]"#,
        ),
    );

    let packet = encode_change(&templates[0], 0x0A0B0C0D as f64, 0x0102 as f64).unwrap();
    assert_eq!(
        packet.bytes,
        [0x20, 0x01, 0x0A, 0x0B, 0x0C, 0x0D, 0x01, 0x02]
    );

    // Negative values wrap instead of clamping
    let packet = encode_change(&templates[0], -1.0, 0.0).unwrap();
    assert_eq!(&packet.bytes[2..6], [0xFF, 0xFF, 0xFF, 0xFF]);
}
