mod common;

use std::time::Duration;

use common::headless;
use tri_rhi::{
    AcquiredImage, ClearValue, FramebufferDesc, GraphicsDevice, LoadOp, OffscreenTarget,
    QueueType, RhiError, SubmitInfo, SwapChainDesc,
};

fn offscreen_chain(device: &GraphicsDevice, image_count: u32) -> (OffscreenTarget, tri_rhi::SwapChain) {
    let target = OffscreenTarget::new(32, 32);
    let chain = device
        .create_swap_chain(
            &target,
            &SwapChainDesc {
                width: 32,
                height: 32,
                image_count,
                ..SwapChainDesc::default()
            },
        )
        .unwrap();
    (target, chain)
}

/// Clear the acquired image, waiting on and signalling the chain's semaphores
fn render(device: &GraphicsDevice, image: &AcquiredImage) {
    let framebuffer = device
        .create_framebuffer(&FramebufferDesc {
            label: None,
            color_attachments: vec![image.texture.clone()],
            depth_attachment: None,
        })
        .unwrap();
    let cmd = device.create_command_buffer(QueueType::Graphics).unwrap();
    cmd.begin_rendering(&framebuffer, &[LoadOp::Clear(ClearValue::Color([0.0, 1.0, 0.0, 1.0]))])
        .unwrap();
    cmd.end_rendering().unwrap();
    cmd.finish().unwrap();
    device
        .submit(
            &cmd,
            &SubmitInfo {
                wait: &[&image.image_available],
                signal: &[&image.render_finished],
            },
        )
        .unwrap();
}

#[test]
fn frames_cycle_through_present() {
    let device = headless();
    let (_target, chain) = offscreen_chain(&device, 3);
    assert_eq!(chain.image_count(), 3);

    let mut seen = Vec::new();
    for _ in 0..6 {
        let image = chain.acquire_next_image(Duration::from_millis(100)).unwrap();
        assert!(!image.suboptimal);
        render(&device, &image);
        let suboptimal = device.present(image.index, &[&image.render_finished]).unwrap();
        assert!(!suboptimal);
        seen.push(image.index);
        device.poll().unwrap();
    }
    assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn acquire_times_out_when_every_image_is_held() {
    let device = headless();
    let (_target, chain) = offscreen_chain(&device, 2);
    let held: Vec<AcquiredImage> = (0..chain.max_acquired())
        .map(|_| chain.acquire_next_image(Duration::ZERO).unwrap())
        .collect();
    assert_eq!(held.len(), 2);

    assert_eq!(
        chain.acquire_next_image(Duration::ZERO).unwrap_err(),
        RhiError::Timeout
    );
    assert_eq!(
        chain.acquire_next_image(Duration::from_millis(20)).unwrap_err(),
        RhiError::Timeout
    );
}

#[test]
fn present_requires_the_acquire_wait() {
    let device = headless();
    let (_target, chain) = offscreen_chain(&device, 3);
    let image = chain.acquire_next_image(Duration::ZERO).unwrap();

    // Nothing waited on image_available yet
    assert!(matches!(
        chain.present(image.index, &[]),
        Err(RhiError::Submission(_))
    ));
    // Never acquired
    let other = (image.index + 1) % 3;
    assert!(matches!(
        chain.present(other, &[]),
        Err(RhiError::InvalidUsage(_))
    ));

    render(&device, &image);
    chain.present(image.index, &[&image.render_finished]).unwrap();
}

#[test]
fn presenting_unfinished_writes_without_a_wait_is_rejected() {
    let device = headless();
    let (_target, chain) = offscreen_chain(&device, 3);
    let image = chain.acquire_next_image(Duration::ZERO).unwrap();
    render(&device, &image);

    assert!(matches!(
        chain.present(image.index, &[]),
        Err(RhiError::Validation(_))
    ));
    device.wait_idle().unwrap();
    // Writes are complete now, so no wait is needed
    chain.present(image.index, &[]).unwrap();
}

#[test]
fn resize_makes_the_chain_stale_until_recreated() {
    let device = headless();
    let (target, chain) = offscreen_chain(&device, 3);
    let image = chain.acquire_next_image(Duration::ZERO).unwrap();

    target.resize(64, 48);
    chain.notify_resized();
    assert!(chain.is_stale());
    assert_eq!(
        chain.acquire_next_image(Duration::ZERO).unwrap_err(),
        RhiError::StaleSwapChain
    );
    assert_eq!(
        chain.present(image.index, &[]).unwrap_err(),
        RhiError::StaleSwapChain
    );

    let fresh = device.recreate_swap_chain(64, 48).unwrap();
    assert_eq!(fresh.extent(), (64, 48));
    assert!(chain.is_stale());
    assert_eq!(
        chain.acquire_next_image(Duration::ZERO).unwrap_err(),
        RhiError::StaleSwapChain
    );

    // Images of the old chain can no longer be used
    let framebuffer = device
        .create_framebuffer(&FramebufferDesc {
            label: None,
            color_attachments: vec![image.texture.clone()],
            depth_attachment: None,
        })
        .unwrap();
    let cmd = device.create_command_buffer(QueueType::Graphics).unwrap();
    cmd.begin_rendering(&framebuffer, &[]).unwrap();
    cmd.end_rendering().unwrap();
    cmd.finish().unwrap();
    assert!(matches!(
        device.submit(&cmd, &SubmitInfo::default()),
        Err(RhiError::Submission(_))
    ));

    let next = fresh.acquire_next_image(Duration::ZERO).unwrap();
    assert_eq!(next.texture.width(), 64);
}

#[test]
fn size_mismatch_is_reported_as_suboptimal() {
    let device = headless();
    let (target, chain) = offscreen_chain(&device, 3);
    target.resize(40, 40);
    let image = chain.acquire_next_image(Duration::ZERO).unwrap();
    assert!(image.suboptimal);
}

#[test]
fn surface_loss_is_distinguishable_and_sticky() {
    let device = headless();
    let (target, chain) = offscreen_chain(&device, 3);
    target.lose();

    assert_eq!(
        chain.acquire_next_image(Duration::ZERO).unwrap_err(),
        RhiError::SurfaceLost
    );
    assert_eq!(
        chain.acquire_next_image(Duration::ZERO).unwrap_err(),
        RhiError::StaleSwapChain
    );
    assert!(matches!(
        device.recreate_swap_chain(32, 32),
        Err(RhiError::SurfaceLost)
    ));

    target.restore();
    let chain = device.recreate_swap_chain(32, 32).unwrap();
    assert!(chain.acquire_next_image(Duration::ZERO).is_ok());
}

#[test]
fn device_present_needs_a_swap_chain() {
    let device = headless();
    assert!(device.swap_chain().is_none());
    assert!(matches!(
        device.present(0, &[]),
        Err(RhiError::InvalidUsage(_))
    ));
    assert!(matches!(
        device.recreate_swap_chain(16, 16),
        Err(RhiError::InvalidUsage(_))
    ));
}

#[test]
fn zero_extent_is_invalid() {
    let device = headless();
    let target = OffscreenTarget::new(0, 0);
    let err = device
        .create_swap_chain(
            &target,
            &SwapChainDesc {
                width: 0,
                height: 0,
                ..SwapChainDesc::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, RhiError::ResourceCreation { .. }));
}
