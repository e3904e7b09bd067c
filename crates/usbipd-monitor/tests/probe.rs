use usbipd_monitor::endpoints::parse_configuration;
use usbipd_monitor::probe::{probe_device, ProbeError};
use usbipd_monitor::sim::{SimChannel, UrbScript};
use usbipd_monitor::urb::{Direction, TransferType};

fn device_descriptor_bytes() -> Vec<u8> {
    let mut raw = vec![0u8; 18];
    raw[0] = 18;
    raw[1] = 1; // DEVICE
    raw[2..4].copy_from_slice(&0x0200u16.to_le_bytes()); // bcdUSB 2.0
    raw[4] = 0; // class per interface
    raw[7] = 64;
    raw[8..10].copy_from_slice(&0x1234u16.to_le_bytes());
    raw[10..12].copy_from_slice(&0xABCDu16.to_le_bytes());
    raw[12..14].copy_from_slice(&0x0100u16.to_le_bytes());
    raw[17] = 1; // one configuration
    raw
}

fn configuration_bytes() -> Vec<u8> {
    let mut raw = vec![
        9, 2, 0, 0, 1, 1, 0, 0xE0, 50, // configuration header
        9, 4, 0, 0, 2, 8, 6, 0x50, 0, // interface 0 alt 0
        7, 5, 0x81, 2, 0, 2, 0, // bulk in
        7, 5, 0x02, 2, 0, 2, 0, // bulk out
    ];
    let total = raw.len() as u16;
    raw[2..4].copy_from_slice(&total.to_le_bytes());
    raw
}

#[tokio::test]
async fn probe_reads_device_and_configuration_descriptors() {
    let channel = SimChannel::new();
    let config = configuration_bytes();
    channel.script(UrbScript::ok().with_data(device_descriptor_bytes()));
    channel.script(UrbScript::ok().with_data(config[..9].to_vec()));
    channel.script(UrbScript::ok().with_data(config.clone()));

    let probed = probe_device(&channel).await.unwrap();
    assert_eq!(probed.descriptor.id_vendor, 0x1234);
    assert_eq!(probed.descriptor.id_product, 0xABCD);
    assert_eq!(probed.descriptor.num_configurations, 1);
    assert_eq!(probed.descriptor.speed(), 3);
    assert_eq!(probed.configurations.len(), 1);
    assert_eq!(probed.configurations[0], config);

    let parsed = parse_configuration(&probed.configurations[0]).unwrap();
    assert_eq!(parsed.value, 1);
    assert_eq!(parsed.interface_info().len(), 1);

    // Every probe request is a control IN on endpoint 0 with short reads
    // allowed.
    for urb in channel.urbs() {
        assert_eq!(urb.endpoint, 0);
        assert_eq!(urb.transfer_type, TransferType::Control);
        assert_eq!(urb.direction, Direction::In);
        assert!(urb.short_ok);
    }
}

#[tokio::test]
async fn probe_rejects_truncated_device_descriptor() {
    let channel = SimChannel::new();
    channel.script(UrbScript::ok().with_data(vec![18, 1, 0, 2])); // 4 of 18 bytes

    let err = probe_device(&channel).await.unwrap_err();
    assert!(matches!(err, ProbeError::Truncated { got: 4, want: 18 }));
}

#[tokio::test]
async fn probe_surfaces_stalled_get_descriptor() {
    let channel = SimChannel::new();
    channel.script(UrbScript::status(usbipd_monitor::ioctl::xfer::STALL));

    let err = probe_device(&channel).await.unwrap_err();
    assert!(matches!(
        err,
        ProbeError::TransferFailed(usbipd_monitor::ioctl::xfer::STALL)
    ));
}
