//! Scriptable in-memory device for tests.
//!
//! `MockDevice` renders a phone-sized framebuffer (so captures are real
//! PNGs with real dimensions) and lets tests script capture failures and
//! execution outcomes. Every executed action is logged for assertions.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use crate::action::Action;

use super::DeviceController;
use super::types::{DeviceError, DeviceResult, ExecResult, Screenshot};

/// Default mock screen dimensions (portrait phone)
pub const MOCK_SCREEN_WIDTH: u32 = 1080;
pub const MOCK_SCREEN_HEIGHT: u32 = 2400;

/// An in-memory device with a drawable screen and scripted behavior
pub struct MockDevice {
    id: String,
    width: u32,
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
    /// Failures returned by upcoming capture calls, in order
    capture_failures: VecDeque<DeviceError>,
    /// Results returned by upcoming execute calls; `ok` once exhausted
    exec_results: VecDeque<ExecResult>,
    /// Every action passed to execute, in order. Shared so tests can
    /// keep a handle after the device moves into an agent loop.
    executed: Arc<Mutex<Vec<Action>>>,
}

impl MockDevice {
    /// Create a mock device with the default phone-sized screen
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_size(id, MOCK_SCREEN_WIDTH, MOCK_SCREEN_HEIGHT)
    }

    /// Create a mock device with a custom screen size
    pub fn with_size(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            buffer: vec![0u8; (width * height * 3) as usize],
            capture_failures: VecDeque::new(),
            exec_results: VecDeque::new(),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a failure for the next capture call
    pub fn fail_next_capture(mut self, error: DeviceError) -> Self {
        self.capture_failures.push_back(error);
        self
    }

    /// Queue a result for the next execute call
    pub fn queue_exec_result(mut self, result: ExecResult) -> Self {
        self.exec_results.push_back(result);
        self
    }

    /// Actions executed so far, in order
    pub fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }

    /// Shared handle onto the execution log
    pub fn exec_log(&self) -> Arc<Mutex<Vec<Action>>> {
        Arc::clone(&self.executed)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Fill the whole screen with a color
    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y + h).min(self.height) {
            for px in x..(x + w).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw an app icon: a rectangle with a centered label, useful for
    /// building recognizable home screens in fixtures
    pub fn draw_app_icon(&mut self, x: u32, y: u32, label: &str) {
        let w = 160;
        let h = 160;
        self.draw_rect(x, y, w, h, [60, 60, 90]);
        let text_x = x + 8;
        let text_y = y + h / 2;
        self.draw_text(text_x, text_y, label, [255, 255, 255], [60, 60, 90]);
    }

    /// Draw text using font8x8 glyphs. Each character is 8x8 pixels;
    /// text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        let mut cursor_x = x;
        for ch in text.chars() {
            self.draw_char(cursor_x, y, ch, fg, bg);
            cursor_x += 8;
            if cursor_x >= self.width {
                break;
            }
        }
    }

    fn draw_char(&mut self, x: u32, y: u32, ch: char, fg: [u8; 3], bg: [u8; 3]) {
        let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as u32;
            if py >= self.height {
                break;
            }
            for bit in 0..8 {
                let px = x + bit;
                if px >= self.width {
                    break;
                }
                // font8x8 stores LSB as leftmost pixel
                let is_fg = (row >> bit) & 1 == 1;
                self.set_pixel(px, py, if is_fg { fg } else { bg });
            }
        }
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = ((y * self.width + x) * 3) as usize;
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx] = color[0];
        self.buffer[idx + 1] = color[1];
        self.buffer[idx + 2] = color[2];
    }

    fn to_png(&self) -> DeviceResult<Vec<u8>> {
        let img: RgbImage = ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| DeviceError::Unknown("buffer size mismatch".to_string()))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DeviceError::Unknown(format!("Failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }
}

impl DeviceController for MockDevice {
    fn capture_screen(&mut self) -> DeviceResult<Screenshot> {
        if let Some(err) = self.capture_failures.pop_front() {
            return Err(err);
        }
        let png_data = self.to_png()?;
        Ok(Screenshot::new(png_data, self.width, self.height))
    }

    fn execute(&mut self, action: &Action) -> ExecResult {
        self.executed.lock().unwrap().push(action.clone());
        self.exec_results.pop_front().unwrap_or_else(ExecResult::ok)
    }

    fn controller_type(&self) -> &str {
        "mock"
    }

    fn device_id(&self) -> &str {
        &self.id
    }
}
