use youplace_shared::{Cell, Viewport};

/// Pan/zoom transform from cell space to screen pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub offset_x: f64,
    pub offset_y: f64,
    /// Screen pixels per cell.
    pub scale: f64,
}

const MIN_SCALE: f64 = 0.5;
const MAX_SCALE: f64 = 64.0;
const ZOOM_SENSITIVITY: f64 = 0.001;

impl Default for Camera {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            scale: 8.0,
        }
    }
}

impl Camera {
    pub fn cell_to_screen(&self, cell: Cell) -> (f64, f64) {
        (
            f64::from(cell.x) * self.scale + self.offset_x,
            f64::from(cell.y) * self.scale + self.offset_y,
        )
    }

    pub fn screen_to_cell(&self, sx: f64, sy: f64) -> Cell {
        let wx = (sx - self.offset_x) / self.scale;
        let wy = (sy - self.offset_y) / self.scale;
        Cell::new(saturate(wx.floor()), saturate(wy.floor()))
    }

    /// Zoom toward a focus point (screen coordinates).
    pub fn zoom_at(&mut self, delta: f64, screen_x: f64, screen_y: f64) {
        let factor = (-delta * ZOOM_SENSITIVITY).exp();
        let new_scale = (self.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
        let ratio = new_scale / self.scale;

        // Keep the cell under the cursor fixed
        self.offset_x = screen_x - (screen_x - self.offset_x) * ratio;
        self.offset_y = screen_y - (screen_y - self.offset_y) * ratio;
        self.scale = new_scale;
    }

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.offset_x += dx;
        self.offset_y += dy;
    }

    /// Cells covered by a `width` x `height` canvas, partially visible ones included.
    pub fn visible_viewport(&self, width: f64, height: f64) -> Viewport {
        let top_left = self.screen_to_cell(0.0, 0.0);
        let bottom_right = self.screen_to_cell(width.max(0.0), height.max(0.0));
        Viewport::new(top_left.x, bottom_right.x, top_left.y, bottom_right.y)
    }

    /// Center the camera on `cell`.
    pub fn center_on(&mut self, cell: Cell, width: f64, height: f64) {
        self.offset_x = width / 2.0 - (f64::from(cell.x) + 0.5) * self.scale;
        self.offset_y = height / 2.0 - (f64::from(cell.y) + 0.5) * self.scale;
    }
}

fn saturate(value: f64) -> i32 {
    value.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}
