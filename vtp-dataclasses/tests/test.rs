#[cfg(test)]
pub mod tests {

  use vtp_dataclasses::status::StatusDatagram;
  use vtp_dataclasses::serialization::Serialization;
  use vtp_dataclasses::evio::{
    ControlEvent,
    ControlEventType,
  };
  use vtp_dataclasses::FromRandom;

  #[test]
  fn serialization_circle_test_for_statusdatagram() {
    // try this 100 times
    for _n in 0..100 {
      let dg       = StatusDatagram::from_random();
      let dg_ser   = dg.to_bytestream();
      assert_eq!(dg_ser.len(), StatusDatagram::SIZE);
      let mut pos  = 0usize;
      let dg_deser = StatusDatagram::from_bytestream(&dg_ser, &mut pos).unwrap();
      assert_eq!(pos, StatusDatagram::SIZE);
      assert_eq!(dg_deser.version, dg.version);
      assert_eq!(dg_deser.source_id, dg.source_id);
      assert_eq!(dg_deser.frame_number, dg.frame_number);
      assert_eq!(dg_deser.event_rate_hz, dg.event_rate_hz);
      assert_eq!(dg_deser.timestamp_nanos, dg.timestamp_nanos);
      assert_eq!(dg_deser, dg);
    }
  }

  #[test]
  fn statusdatagram_fields_are_big_endian() {
    for _n in 0..100 {
      let dg = StatusDatagram::from_random();
      let bs = dg.to_bytestream();
      assert_eq!(&bs[4..8],   &dg.source_id.to_be_bytes());
      assert_eq!(&bs[8..16],  &dg.frame_number.to_be_bytes());
      assert_eq!(&bs[16..20], &dg.event_rate_hz.to_be_bytes());
      assert_eq!(&bs[20..28], &dg.timestamp_nanos.to_be_bytes());
    }
  }

  #[test]
  fn statusdatagram_decodes_at_offset() {
    let dg         = StatusDatagram::from_random();
    let mut stream = vec![0u8, 1, 2];
    stream.extend_from_slice(&dg.to_bytestream());
    let mut pos = 3usize;
    assert_eq!(StatusDatagram::from_bytestream(&stream, &mut pos).unwrap(), dg);
  }

  #[test]
  fn control_records_for_run_transitions() {
    for ev in [ControlEvent::prestart(17, 2),
               ControlEvent::go(0),
               ControlEvent::end(123456)] {
      let record  = ev.to_record(1, 99);
      let decoded = ControlEvent::from_record(&record).unwrap();
      assert_eq!(decoded.event_type, ev.event_type);
      if ev.event_type == ControlEventType::Prestart {
        assert_eq!(decoded.run_number, 17);
      } else {
        assert_eq!(decoded.event_count, ev.event_count);
      }
    }
  }
}
