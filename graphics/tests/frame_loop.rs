//! Device-free tests for the frame-loop state machine and selection logic.

use ash::vk;

use vermilion_graphics::frame::FrameRing;
use vermilion_graphics::swapchain::{choose_present_mode, choose_surface_format, needs_recreation};
use vermilion_graphics::{BindingKind, BindingTemplate, Descriptor};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_triple_buffered_session_cycles_slots() {
    init_logging();

    let mut ring = FrameRing::new(3);
    let mut visited = Vec::new();

    for _ in 0..10 {
        visited.push(ring.current());
        ring.advance();
    }

    assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    // Every slot gets its turn before any slot repeats.
    assert_eq!(visited[0..3], [0, 1, 2]);
}

#[test]
fn test_resize_triggers_exactly_one_recreation() {
    init_logging();

    let mut extent = vk::Extent2D {
        width: 800,
        height: 600,
    };

    // Ten frames; the window grows once at frame 4.
    let mut recreations = 0;
    for frame in 0..10 {
        let reported = if frame >= 4 {
            vk::Extent2D {
                width: 1280,
                height: 720,
            }
        } else {
            extent
        };

        if needs_recreation(extent, reported) {
            extent = reported;
            recreations += 1;
        }
    }

    assert_eq!(recreations, 1);
    assert_eq!(extent.width, 1280);
    assert_eq!(extent.height, 720);
}

#[test]
fn test_minimize_does_not_recreate() {
    let extent = vk::Extent2D {
        width: 800,
        height: 600,
    };
    let minimized = vk::Extent2D {
        width: 0,
        height: 0,
    };

    assert!(!needs_recreation(extent, minimized));
}

#[test]
fn test_present_mode_selection_is_deterministic() {
    let available = [
        vk::PresentModeKHR::FIFO,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ];

    let first = choose_present_mode(false, &available);
    for _ in 0..100 {
        assert_eq!(choose_present_mode(false, &available), first);
    }
    assert_eq!(first, vk::PresentModeKHR::MAILBOX);

    // vsync always wins regardless of what else is available.
    assert_eq!(
        choose_present_mode(true, &available),
        vk::PresentModeKHR::FIFO
    );
}

#[test]
fn test_surface_format_selection_is_deterministic() {
    let formats = [
        vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
    ];

    let first = choose_surface_format(&formats).unwrap();
    for _ in 0..100 {
        assert_eq!(choose_surface_format(&formats).unwrap().format, first.format);
    }
    assert_eq!(first.format, vk::Format::B8G8R8A8_UNORM);
}

#[test]
fn test_binding_template_is_immutable_and_ordered() {
    let kinds = vec![
        BindingKind::Buffer,
        BindingKind::Buffer,
        BindingKind::Image,
    ];
    let template = BindingTemplate::new(kinds.clone(), vk::ShaderStageFlags::VERTEX);

    assert_eq!(template.len(), 3);
    assert_eq!(template.kinds(), kinds.as_slice());
}

#[test]
fn test_descriptor_tagging_round_trip() {
    use ash::vk::Handle;

    let descriptors = [
        Descriptor::Buffer {
            buffer: vk::Buffer::from_raw(1),
            offset: 0,
            range: vk::WHOLE_SIZE,
        },
        Descriptor::Image {
            view: vk::ImageView::from_raw(2),
            sampler: vk::Sampler::from_raw(3),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
    ];

    let kinds: Vec<BindingKind> = descriptors.iter().map(|d| d.kind()).collect();
    assert_eq!(kinds, vec![BindingKind::Buffer, BindingKind::Image]);
}
