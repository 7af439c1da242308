//! Channels surviving endpoint reallocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_channel::{Channel, ChannelOptions, ConnectionStatus, StatusChanged};
use tether_memory::{allocate, deallocate, MemoryConfig};
use tether_message::{
    MessageError, MessageReader, MessageWriter, StringLineDecoder, StringLineEncoder,
};

async fn wait_for_status(channel: &Channel, want: ConnectionStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while channel.status() != want {
        assert!(
            Instant::now() < deadline,
            "channel {} did not reach {want:?}",
            channel.name()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<StatusChanged>) -> Vec<StatusChanged> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

#[tokio::test]
async fn channels_ride_over_a_quiet_reallocation() {
    let name = "rc-quiet-realloc";
    allocate(name);
    let a = Channel::new(Arc::new(MemoryConfig::new(name))).unwrap();
    let b = Channel::new(Arc::new(MemoryConfig::new(name))).unwrap();
    let mut events_a = a.subscribe();
    wait_for_status(&a, ConnectionStatus::Connected).await;
    wait_for_status(&b, ConnectionStatus::Connected).await;

    let writer = MessageWriter::new(a.writer(), StringLineEncoder::strings("\n"));
    let reader = MessageReader::new(b.reader(), StringLineDecoder::strings("\n"));

    for i in 0..10 {
        assert!(writer.write(&format!("Message {i}"), None).await.unwrap());
    }
    for i in 0..10 {
        assert_eq!(
            reader.read_next(None).await.unwrap().as_deref(),
            Some(format!("Message {i}").as_str())
        );
    }

    // Pull the endpoint out from under both channels while they are idle.
    deallocate(name);
    tokio::time::sleep(Duration::from_millis(50)).await;
    allocate(name);

    wait_for_status(&a, ConnectionStatus::Connected).await;
    wait_for_status(&b, ConnectionStatus::Connected).await;

    for i in 10..20 {
        assert!(writer.write(&format!("Message {i}"), None).await.unwrap());
    }
    for i in 10..20 {
        assert_eq!(
            reader.read_next(None).await.unwrap().as_deref(),
            Some(format!("Message {i}").as_str())
        );
    }

    // Give the event pump a beat, then check the outage was reported.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = drain(&mut events_a);
    assert!(
        events.iter().any(|e| e.status != ConnectionStatus::Connected),
        "expected at least one degraded status event, got {events:?}"
    );
    assert!(
        events
            .iter()
            .any(|e| e.status == ConnectionStatus::Connected),
        "expected a reconnected event, got {events:?}"
    );
    // Consecutive emissions never repeat a status.
    for pair in events.windows(2) {
        assert_ne!(pair[0].status, pair[1].status);
    }

    a.dispose().await;
    b.dispose().await;
    deallocate(name);
}

#[tokio::test]
async fn availability_decays_until_the_endpoint_appears() {
    let name = "rc-late-endpoint";
    // Deliberately not allocated: every open attempt fails.
    let a = Channel::new(Arc::new(MemoryConfig::new(name))).unwrap();
    let mut events = a.subscribe();

    // Low → DangerZone → Offline, one step per failed attempt.
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < 2 && Instant::now() < deadline {
        if let Ok(e) =
            tokio::time::timeout(Duration::from_millis(200), events.recv()).await
        {
            seen.push(e.expect("event stream open").status);
        }
    }
    assert_eq!(
        seen,
        [ConnectionStatus::DangerZone, ConnectionStatus::Offline]
    );

    // The reconnector never gives up; publish the endpoint and let a
    // peer arrive.
    allocate(name);
    let b = Channel::new(Arc::new(MemoryConfig::new(name))).unwrap();
    wait_for_status(&a, ConnectionStatus::Connected).await;
    wait_for_status(&b, ConnectionStatus::Connected).await;

    a.dispose().await;
    b.dispose().await;
    deallocate(name);
}

/// Tiny deterministic generator for the chaos schedule.
struct XorShift(u64);

impl XorShift {
    fn next_in(&mut self, lo: u64, hi: u64) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        lo + x % (hi - lo)
    }
}

#[tokio::test]
async fn lockstep_exchange_survives_chaotic_reallocation() {
    let name = "rc-chaos";
    allocate(name);
    let options = ChannelOptions {
        write_timeout: Some(Duration::from_millis(200)),
        ..ChannelOptions::default()
    };
    let a = Channel::new(Arc::new(
        MemoryConfig::new(name).with_options(options.clone()),
    ))
    .unwrap();
    let b = Channel::new(Arc::new(MemoryConfig::new(name).with_options(options))).unwrap();
    let mut events_a = a.subscribe();
    wait_for_status(&a, ConnectionStatus::Connected).await;
    wait_for_status(&b, ConnectionStatus::Connected).await;

    const COUNT: u64 = 100;

    // Responder: deliver each index once, ack every sighting.
    let responder = {
        let reader = MessageReader::new(b.reader(), StringLineDecoder::strings("\n"));
        let writer = MessageWriter::new(b.writer(), StringLineEncoder::strings("\n"));
        tokio::spawn(async move {
            let mut delivered: Vec<u64> = Vec::new();
            let mut next_expected = 0u64;
            while next_expected < COUNT {
                let got = reader
                    .read_next_with(None, Some(Duration::from_millis(200)), |_| true)
                    .await;
                let Ok(Some(message)) = got else { continue };
                let Some(index) = message
                    .strip_prefix("Message ")
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                if index == next_expected {
                    delivered.push(index);
                    next_expected += 1;
                }
                // Ack every sighting, duplicates included; the sender
                // stops resending once it hears the ack.
                let _ = writer.write(&format!("Ack {index}"), None).await;
            }
            delivered
        })
    };

    // Disruptor: rip the endpoint out at deterministic pseudo-random
    // intervals, then put it back.
    let disruptor = tokio::spawn(async move {
        let mut rng = XorShift(0x5DEECE66D);
        for _ in 0..12 {
            tokio::time::sleep(Duration::from_millis(rng.next_in(60, 140))).await;
            deallocate(name);
            tokio::time::sleep(Duration::from_millis(rng.next_in(5, 25))).await;
            allocate(name);
        }
    });

    // Sender: resend each message until its ack comes back.
    let writer = MessageWriter::new(a.writer(), StringLineEncoder::strings("\n"));
    let reader = MessageReader::new(a.reader(), StringLineDecoder::strings("\n"));
    let exchange = async {
        for i in 0..COUNT {
            let expected_ack = format!("Ack {i}");
            loop {
                match writer.write(&format!("Message {i}"), None).await {
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {}
                    Err(e) => panic!("send failed hard: {e}"),
                }
                let acked = reader
                    .read_next_with(None, Some(Duration::from_millis(200)), |m: &String| {
                        m == &expected_ack
                    })
                    .await;
                match acked {
                    Ok(Some(_)) => break,
                    Ok(None) => {}
                    Err(MessageError::FrameTimeout { .. }) => {}
                    Err(e) => panic!("ack read failed hard: {e}"),
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), exchange)
        .await
        .expect("exchange finished despite chaos");

    let delivered = tokio::time::timeout(Duration::from_secs(10), responder)
        .await
        .expect("responder finished")
        .unwrap();
    // Everything arrived, in order, exactly once.
    assert_eq!(delivered, (0..COUNT).collect::<Vec<_>>());

    disruptor.await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = drain(&mut events_a);
    assert!(
        events.iter().any(|e| e.status != ConnectionStatus::Connected),
        "chaos produced no status change"
    );

    a.dispose().await;
    b.dispose().await;
    deallocate(name);
}
