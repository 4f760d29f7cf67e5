use std::time::Duration;

pub fn main() -> flagsync::Result<()> {
    env_logger::init();

    let api_key = std::env::var("FLAGSYNC_API_KEY").unwrap();
    let sync = flagsync::ClientConfig::from_api_key(api_key)
        .listener(|event| println!("{:?}", event))
        .to_synchronizer()?;

    // Segment memberships are kept in sync for registered subscribers only.
    sync.add_subscriber("test-subject");
    sync.start();

    // Block waiting for the first full sync. Until it completes the cache is empty.
    sync.wait_for_initial_sync()?;
    println!("Sync mode: {:?}", sync.mode());

    // Let streaming deliver a few changes.
    std::thread::sleep(Duration::from_secs(60));

    sync.stop();
    Ok(())
}
