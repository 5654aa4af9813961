//! Device-gated integration tests.
//!
//! These need a display server and a discrete GPU; without one the harness
//! returns `None` and the test skips. The window system allows a single
//! event loop per process, so every check runs under one test entry point
//! against one shared context.

mod common;

use ash::vk;
use common::{generate_test_pattern, TestContext};
use vermilion_graphics::{BindingKind, Descriptor, FrameSynchronizer, ImageDesc, Swapchain};

#[test]
fn test_gpu_session() {
    let _ = env_logger::builder().is_test(true).try_init();

    let Some(tc) = TestContext::new() else {
        eprintln!("No display or compatible GPU available, skipping");
        return;
    };

    verify_storage_upload_roundtrip(&tc);
    verify_index_upload(&tc);
    verify_texture_upload(&tc);
    verify_frame_cycle(&tc);
}

/// Upload a byte pattern into a device-local storage buffer and read it back
/// through the staged download path.
fn verify_storage_upload_roundtrip(tc: &TestContext) {
    let data = generate_test_pattern(1024);
    let buffer = tc
        .allocator
        .create_storage_buffer(&tc.ctx, &data, "roundtrip storage")
        .expect("Failed to create storage buffer");

    let readback = tc
        .allocator
        .download_buffer(&tc.ctx, &buffer, data.len() as u64)
        .expect("Failed to read storage buffer back");
    assert_eq!(readback, data, "storage buffer contents changed in transit");

    // Partial downloads see the same prefix.
    let prefix = tc
        .allocator
        .download_buffer(&tc.ctx, &buffer, 256)
        .expect("Failed to read buffer prefix");
    assert_eq!(prefix, data[..256]);
}

fn verify_index_upload(tc: &TestContext) {
    let indices: Vec<u32> = (0..768).collect();
    let buffer = tc
        .allocator
        .create_index_buffer(
            &tc.ctx,
            bytemuck::cast_slice(&indices),
            indices.len() as u32,
            "test indices",
        )
        .expect("Failed to create index buffer");

    assert_eq!(buffer.element_count(), 768);
    assert_eq!(buffer.size(), 768 * 4);
}

/// Upload pixel data, attach a sampler and bind the image as a combined
/// image sampler. A sampler must be attached before the image is bound.
fn verify_texture_upload(tc: &TestContext) {
    let pixels = generate_test_pattern(4 * 4 * 4);
    let mut image = tc
        .allocator
        .create_image(&ImageDesc {
            width: 4,
            height: 4,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            name: "test texture",
        })
        .expect("Failed to create image");

    tc.allocator
        .upload_image(&tc.ctx, &image, &pixels)
        .expect("Failed to upload pixels");

    image
        .attach_sampler(tc.ctx.capabilities().max_sampler_anisotropy)
        .expect("Failed to attach sampler");
    assert!(image.sampler().is_some());

    let descriptor = Descriptor::sampled_image(&image);
    assert_eq!(descriptor.kind(), BindingKind::Image);
}

/// Run ten full frames through the synchronizer: acquire, record, submit,
/// present. Exercises the fence and semaphore handoff across every slot in
/// the ring more than once.
fn verify_frame_cycle(tc: &TestContext) {
    let mut swapchain =
        Swapchain::create(&tc.ctx, &tc.allocator, true).expect("Failed to create swapchain");
    let mut frames = FrameSynchronizer::new(&tc.ctx, &tc.allocator, &swapchain, 256)
        .expect("Failed to create frame synchronizer");

    for frame in 0..10u8 {
        frames
            .begin_frame(&tc.ctx, &tc.allocator, &mut swapchain)
            .expect("Failed to begin frame");
        assert!((frames.current_image() as usize) < swapchain.image_count());

        frames
            .set_scene_data(&[frame; 16])
            .expect("Failed to write scene data");

        frames.begin(&swapchain, [0.1, 0.2, 0.3, 1.0]);
        frames.end(&swapchain);
        frames.end_frame(&swapchain).expect("Failed to end frame");
    }

    assert!(frames.stats().mspf_cpu() > 0.0);
    tc.ctx.wait_idle();
}
