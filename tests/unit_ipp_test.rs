// tests/unit_ipp_test.rs

use bytes::BytesMut;
use spoolbridge::core::capabilities::{MediaSize, Resolution};
use spoolbridge::core::spooler::client::parse_capabilities;
use spoolbridge::core::spooler::ipp::{
    IppAttribute, IppCodec, IppGroup, IppMessage, IppValue, OP_CUPS_GET_PRINTERS,
    OP_GET_PRINTER_ATTRIBUTES, TAG_OPERATION, TAG_PRINTER,
};
use tokio_util::codec::{Decoder, Encoder};

fn round_trip(message: IppMessage) -> IppMessage {
    let mut buf = BytesMut::new();
    IppCodec.encode(message, &mut buf).unwrap();
    IppCodec.decode(&mut buf).unwrap().unwrap()
}

#[test]
fn request_carries_charset_and_language_first() {
    let message = IppMessage::request(OP_CUPS_GET_PRINTERS, 1);
    let operation = message.first_group(TAG_OPERATION).unwrap();
    assert_eq!(operation.attributes[0].name, "attributes-charset");
    assert_eq!(operation.attributes[1].name, "attributes-natural-language");
}

#[test]
fn byte_level_header_layout() {
    let message = IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, 0x0102);
    let bytes = message.encode_to_vec().unwrap();
    // version 2.0, operation 0x000B, request id 0x00000102.
    assert_eq!(&bytes[..8], &[2, 0, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x02]);
    // The message ends with the end-of-attributes tag.
    assert_eq!(*bytes.last().unwrap(), 0x03);
}

#[test]
fn values_of_every_flavour_round_trip() {
    let mut printer = IppGroup::new(TAG_PRINTER);
    printer.attributes.push(IppAttribute::new(
        "printer-state",
        IppValue::Enum(4),
    ));
    printer.attributes.push(IppAttribute::new(
        "printer-is-accepting-jobs",
        IppValue::Boolean(true),
    ));
    printer.attributes.push(IppAttribute::new(
        "queued-job-count",
        IppValue::Integer(3),
    ));
    printer.attributes.push(IppAttribute::new(
        "printer-uri-supported",
        IppValue::Uri("ipp://printer.local/ipp/print".into()),
    ));
    printer.attributes.push(IppAttribute::new(
        "copies-supported",
        IppValue::RangeOfInteger { lower: 1, upper: 99 },
    ));
    printer.attributes.push(IppAttribute::new(
        "printer-resolution-default",
        IppValue::Resolution {
            x: 600,
            y: 600,
            units: 3,
        },
    ));

    let decoded = round_trip(IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, 9).group(printer));
    let group = decoded.first_group(TAG_PRINTER).unwrap();
    assert_eq!(group.attr("printer-state").unwrap().first_i32(), Some(4));
    assert_eq!(
        group
            .attr("printer-is-accepting-jobs")
            .unwrap()
            .first_bool(),
        Some(true)
    );
    assert_eq!(
        group.attr("copies-supported").unwrap().values[0],
        IppValue::RangeOfInteger { lower: 1, upper: 99 }
    );
}

#[test]
fn nested_collections_round_trip() {
    let media_size = IppValue::Collection(vec![
        ("x-dimension".into(), IppValue::Integer(21000)),
        ("y-dimension".into(), IppValue::Integer(29700)),
    ]);
    let media_col = IppValue::Collection(vec![
        ("media-size".into(), media_size),
        ("media-source".into(), IppValue::Keyword("tray-1".into())),
        ("media-type".into(), IppValue::Keyword("stationery".into())),
    ]);
    let mut printer = IppGroup::new(TAG_PRINTER);
    printer
        .attributes
        .push(IppAttribute::new("media-col-database", media_col.clone()));

    let decoded = round_trip(IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, 2).group(printer));
    assert_eq!(
        decoded
            .first_group(TAG_PRINTER)
            .unwrap()
            .attr("media-col-database")
            .unwrap()
            .values[0],
        media_col
    );
}

#[test]
fn truncated_buffers_ask_for_more_data() {
    let message = IppMessage::request(OP_CUPS_GET_PRINTERS, 5).operation_attr(IppAttribute::new(
        "printer-uri",
        IppValue::Uri("ipp://localhost:631/".into()),
    ));
    let mut full = BytesMut::new();
    IppCodec.encode(message, &mut full).unwrap();

    for cut in 1..full.len() {
        let mut partial = BytesMut::from(&full[..cut]);
        assert!(
            IppCodec.decode(&mut partial).unwrap().is_none(),
            "cut at {cut} should be incomplete"
        );
    }
}

#[test]
fn printer_attributes_normalise_into_capabilities() {
    let mut printer = IppGroup::new(TAG_PRINTER);
    printer.attributes.push(IppAttribute::new(
        "printer-make-and-model",
        IppValue::Text("HP LaserJet 600".into()),
    ));
    printer.attributes.push(IppAttribute::new(
        "color-supported",
        IppValue::Boolean(true),
    ));
    printer.attributes.push(IppAttribute::new(
        "pages-per-minute",
        IppValue::Integer(35),
    ));
    printer.attributes.push(IppAttribute::with_values(
        "document-format-supported",
        vec![
            IppValue::MimeMediaType("application/pdf".into()),
            IppValue::MimeMediaType("image/urf".into()),
        ],
    ));
    printer.attributes.push(IppAttribute::with_values(
        "media-supported",
        vec![
            IppValue::Keyword("iso_a4_210x297mm".into()),
            IppValue::Keyword("na_letter_8.5x11in".into()),
        ],
    ));
    printer.attributes.push(IppAttribute::with_values(
        "sides-supported",
        vec![
            IppValue::Keyword("one-sided".into()),
            IppValue::Keyword("two-sided-long-edge".into()),
        ],
    ));
    printer.attributes.push(IppAttribute::with_values(
        "printer-resolution-supported",
        vec![
            IppValue::Resolution {
                x: 300,
                y: 300,
                units: 3,
            },
            IppValue::Resolution {
                x: 600,
                y: 600,
                units: 3,
            },
        ],
    ));
    printer.attributes.push(IppAttribute::new(
        "media-default",
        IppValue::Keyword("iso_a4_210x297mm".into()),
    ));

    let caps = parse_capabilities(&printer);
    assert_eq!(caps.make_model, "HP LaserJet 600");
    assert!(caps.color);
    assert!(caps.duplex);
    assert_eq!(caps.throughput, 35);
    assert!(caps.accepts_format("application/pdf"));
    assert!(caps.media_sizes.contains(&MediaSize::new(21000, 29700)));
    assert!(caps.resolutions.contains(&Resolution::new(600, 600)));
    assert_eq!(
        caps.defaults.get("media").map(|s| s.as_str()),
        Some("iso_a4_210x297mm")
    );
}
