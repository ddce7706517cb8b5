//! Register / resolve / fetch flows through the service facade

use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
use std::io::Cursor;
use urlpool::error::{Error, Result};
use urlpool::pool::PoolKind;
use urlpool::{Registration, ServiceConfig, SlotId, SlotOptions, UrlPoolService};

fn config(dir: &std::path::Path) -> ServiceConfig {
    ServiceConfig {
        data_dir: dir.join("data"),
        cache_dir: dir.join("cache"),
        text_pool_size: 8,
        video_pool_size: 4,
        ..ServiceConfig::default()
    }
}

fn registered(registration: Registration) -> urlpool::RegisteredSlot {
    match registration {
        Registration::Registered(slot) => slot,
        Registration::PoolExhausted => panic!("pool unexpectedly exhausted"),
    }
}

#[tokio::test]
async fn test_pools_are_independent() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = UrlPoolService::open(&config(dir.path()))?;

    let text = registered(
        service
            .register(PoolKind::TextImage, "https://same", SlotOptions::new(256, true))
            .await?,
    );
    let video = registered(
        service
            .register(PoolKind::Video, "https://same", SlotOptions::new(256, true))
            .await?,
    );
    assert_eq!(text.id, video.id, "both pools start from slot 1");

    let text_slot = service.resolve(PoolKind::TextImage, text.id).await?;
    let video_slot = service.resolve(PoolKind::Video, video.id).await?;
    assert_eq!(text_slot.max_size, 256);
    // video slots carry no image options
    assert_eq!((video_slot.max_size, video_slot.allow_cache), (0, true));
    Ok(())
}

#[tokio::test]
async fn test_resolve_unknown_ids() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = UrlPoolService::open(&config(dir.path()))?;

    for id in [1, 8, 9, 10_000] {
        let result = service.resolve(PoolKind::TextImage, SlotId::new(id)).await;
        assert!(matches!(result, Err(Error::NotFound(_))), "id {}", id);
    }
    Ok(())
}

#[tokio::test]
async fn test_registrations_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path());

    let urls: Vec<String> = (0..5).map(|i| format!("https://batch/{}", i)).collect();
    let first = {
        let service = UrlPoolService::open(&config)?;
        let slots = service
            .register_batch(PoolKind::TextImage, &urls, SlotOptions::default())
            .await?;
        assert_eq!(slots.len(), 5);
        service.compact().await?;
        slots
    };

    let service = UrlPoolService::open(&config)?;
    for slot in &first {
        let resolved = service.resolve(PoolKind::TextImage, slot.id).await?;
        assert_eq!(resolved.url.as_deref(), Some(slot.url.as_str()));
    }

    // re-registering after the restart renews the same slots
    let again = service
        .register_batch(PoolKind::TextImage, &urls, SlotOptions::default())
        .await?;
    let before: Vec<SlotId> = first.iter().map(|s| s.id).collect();
    let after: Vec<SlotId> = again.iter().map(|s| s.id).collect();
    assert_eq!(before, after);

    let stats = service.stats().await?;
    let text = stats
        .pools
        .iter()
        .find(|p| p.pool == PoolKind::TextImage)
        .expect("text pool stats");
    assert_eq!((text.capacity, text.live), (8, 5));
    Ok(())
}

#[tokio::test]
async fn test_invalid_registrations() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = UrlPoolService::open(&config(dir.path()))?;

    let empty = service
        .register(PoolKind::TextImage, "", SlotOptions::default())
        .await;
    assert!(matches!(empty, Err(Error::InvalidArgument(_))));

    let long = format!("https://x/{}", "a".repeat(5000));
    let too_long = service
        .register(PoolKind::TextImage, &long, SlotOptions::default())
        .await;
    assert!(matches!(too_long, Err(Error::InvalidArgument(_))));

    let too_big = service
        .register(PoolKind::TextImage, "https://x", SlotOptions::new(4096, true))
        .await;
    assert!(matches!(too_big, Err(Error::InvalidArgument(_))));
    Ok(())
}

#[tokio::test]
async fn test_fetch_image_for_registered_slot() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let banner = DynamicImage::ImageRgb8(RgbImage::new(800, 400));
    let mut body = Vec::new();
    banner
        .write_to(&mut Cursor::new(&mut body), ImageFormat::Png)
        .expect("encode");
    let mock = server
        .mock("GET", "/banner.png")
        .with_status(200)
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let service = UrlPoolService::open(&config(dir.path()))?;
    let url = format!("{}/banner.png", server.url());

    let slot = registered(
        service
            .register(PoolKind::TextImage, &url, SlotOptions::new(200, true))
            .await?,
    );
    let resolved = service.resolve(PoolKind::TextImage, slot.id).await?;

    let bytes = service
        .fetch_image(&url, resolved.max_size, resolved.allow_cache)
        .await?;
    let decoded = image::load_from_memory(&bytes).expect("decode");
    assert_eq!(decoded.dimensions(), (200, 100));

    // second call is served from the disk cache
    service
        .fetch_image(&url, resolved.max_size, resolved.allow_cache)
        .await?;
    mock.assert_async().await;

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_fetch_failure_maps_to_fetch_error() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/gone.png")
        .with_status(410)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let service = UrlPoolService::open(&config(dir.path()))?;

    let result = service
        .fetch_image(&format!("{}/gone.png", server.url()), 64, true)
        .await;
    assert!(matches!(
        result,
        Err(Error::Fetch(urlpool::FetchError::Status(410)))
    ));
    Ok(())
}
