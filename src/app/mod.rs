mod scene;

use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::{Report, Result};
use ironframe::{Context, ContextConfig};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use scene::DemoScene;

pub struct App {
    config: ContextConfig,
    window: Option<Arc<Window>>,
    // Declared before the context so its resources go first
    scene: Option<DemoScene>,
    context: Option<Context>,

    // State
    request_redraws: bool,
    resize_requested: bool,
    close_requested: bool,
    error: Option<Report>,
}

impl App {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            window: None,
            scene: None,
            context: None,

            request_redraws: true,
            resize_requested: false,
            close_requested: false,
            error: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.run_app(&mut self)?;

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes().with_title(self.config.app_name.clone());
        let window = Arc::new(event_loop.create_window(attributes)?);
        let context = Context::with_window(window.clone(), self.config.clone())?;
        let scene = DemoScene::new(&context)?;

        log::info!(
            "Running on {} ({} swapchain images, {}x{})",
            context.device().name(),
            context.image_count(),
            context.extent().width,
            context.extent().height
        );

        self.window = Some(window);
        self.scene = Some(scene);
        self.context = Some(context);
        Ok(())
    }

    fn fail(&mut self, err: Report) {
        log::error!("{:?}", err);
        self.error = Some(err);
        self.close_requested = true;
    }

    fn draw(&mut self) {
        if let Err(err) = self.try_draw() {
            self.fail(err);
        }
    }

    fn try_draw(&mut self) -> Result<()> {
        let (Some(window), Some(scene), Some(context)) =
            (self.window.as_ref(), self.scene.as_mut(), self.context.as_mut())
        else {
            return Ok(());
        };

        if self.resize_requested {
            let PhysicalSize { width, height } = window.inner_size();
            if width == 0 || height == 0 {
                // Minimized; nothing to present into
                return Ok(());
            }
            match scene.resize(context, vk::Extent2D { width, height }) {
                Ok(()) => self.resize_requested = false,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(()),
                Err(err) => return Err(eyre!("Swapchain recreation failed: {:?}", err)),
            }
        }

        match scene.draw(context) {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.resize_requested = true;
                Ok(())
            }
            Err(err) => Err(eyre!("Frame failed: {:?}", err)),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_none() {
            if let Err(err) = self.init(event_loop) {
                self.fail(err);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent
    ) {
        if self.window.as_ref().map(|window| window.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                self.resize_requested = true;
            }
            WindowEvent::RedrawRequested => {
                self.draw();
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: key,
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => match key.as_ref() {
                Key::Character("r") => {
                    self.request_redraws = !self.request_redraws;
                    log::info!("request_redraws: {}", self.request_redraws);
                }
                Key::Named(NamedKey::Escape) => {
                    self.close_requested = true;
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.request_redraws {
            if let Some(window) = self.window.as_ref() {
                window.request_redraw();
            }
        }

        if self.close_requested {
            event_loop.exit();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.scene = None;
        self.context = None;
    }
}
