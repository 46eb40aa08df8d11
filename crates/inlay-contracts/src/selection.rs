use crate::error::GenerateError;

/// Minimum extent of a selection on each axis, in pixels. Clicks and short
/// drags below this are expanded symmetrically about their center.
pub const MIN_SELECTION_EXTENT: u32 = 10;

/// User-drawn placement region on the background, in pixel coordinates.
///
/// Invariants after construction: `left < right <= image width`,
/// `top < bottom <= image height`, and both extents are at least
/// [`MIN_SELECTION_EXTENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl SelectionRect {
    /// Build a selection from raw drag coordinates, expanding degenerate
    /// rects and clamping to the image bounds.
    pub fn new(
        left: u32,
        top: u32,
        right: u32,
        bottom: u32,
        image_width: u32,
        image_height: u32,
    ) -> Result<Self, GenerateError> {
        if left > right || top > bottom {
            return Err(GenerateError::InvalidInput(format!(
                "selection ({left},{top},{right},{bottom}) has inverted corners"
            )));
        }
        if right > image_width || bottom > image_height {
            return Err(GenerateError::InvalidInput(format!(
                "selection ({left},{top},{right},{bottom}) exceeds image {image_width}x{image_height}"
            )));
        }
        if image_width < MIN_SELECTION_EXTENT || image_height < MIN_SELECTION_EXTENT {
            return Err(GenerateError::InvalidInput(format!(
                "image {image_width}x{image_height} is too small for a selection"
            )));
        }

        let (left, right) = expand_axis(left, right, image_width);
        let (top, bottom) = expand_axis(top, bottom, image_height);
        Ok(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (u32, u32) {
        (
            (self.left + self.right) / 2,
            (self.top + self.bottom) / 2,
        )
    }

    /// Nine-region tag (top/middle/bottom x left/center/right) for the
    /// selection centroid, used to align the vision model's language with
    /// the rectangle.
    pub fn position_tag(&self, image_width: u32, image_height: u32) -> &'static str {
        let (center_x, center_y) = self.center();
        let column = third_index(center_x, image_width);
        let row = third_index(center_y, image_height);
        match (row, column) {
            (0, 0) => "top-left",
            (0, 1) => "top-center",
            (0, _) => "top-right",
            (1, 0) => "middle-left",
            (1, 1) => "middle-center",
            (1, _) => "middle-right",
            (_, 0) => "bottom-left",
            (_, 1) => "bottom-center",
            (_, _) => "bottom-right",
        }
    }
}

fn third_index(value: u32, extent: u32) -> u32 {
    if extent == 0 {
        return 1;
    }
    ((value as u64 * 3) / extent as u64).min(2) as u32
}

fn expand_axis(low: u32, high: u32, extent: u32) -> (u32, u32) {
    let span = high - low;
    if span >= MIN_SELECTION_EXTENT {
        return (low, high);
    }
    let center = (low + high) / 2;
    let half = MIN_SELECTION_EXTENT / 2;
    let mut low = center.saturating_sub(half);
    let mut high = low + MIN_SELECTION_EXTENT;
    if high > extent {
        high = extent;
        low = extent - MIN_SELECTION_EXTENT;
    }
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_area_click_expands_to_minimum_inside_image() {
        let rect = SelectionRect::new(40, 40, 40, 40, 100, 100).unwrap();
        assert_eq!(rect.width(), MIN_SELECTION_EXTENT);
        assert_eq!(rect.height(), MIN_SELECTION_EXTENT);
        assert_eq!(rect, SelectionRect { left: 35, top: 35, right: 45, bottom: 45 });
    }

    #[test]
    fn expansion_clamps_to_image_edge() {
        let rect = SelectionRect::new(98, 99, 100, 100, 100, 100).unwrap();
        assert_eq!(rect.width(), MIN_SELECTION_EXTENT);
        assert_eq!(rect.height(), MIN_SELECTION_EXTENT);
        assert_eq!(rect.right, 100);
        assert_eq!(rect.bottom, 100);
    }

    #[test]
    fn valid_drag_is_preserved() {
        let rect = SelectionRect::new(400, 100, 600, 500, 800, 600).unwrap();
        assert_eq!(rect, SelectionRect { left: 400, top: 100, right: 600, bottom: 500 });
    }

    #[test]
    fn out_of_bounds_selection_is_rejected() {
        let err = SelectionRect::new(0, 0, 900, 100, 800, 600).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidInput(_)));
    }

    #[test]
    fn inverted_corners_are_rejected() {
        let err = SelectionRect::new(50, 10, 40, 20, 100, 100).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidInput(_)));
    }

    #[test]
    fn position_tags_cover_the_grid() {
        let image = (900u32, 900u32);
        let tag = |left, top| {
            SelectionRect::new(left, top, left + 20, top + 20, image.0, image.1)
                .unwrap()
                .position_tag(image.0, image.1)
        };
        assert_eq!(tag(10, 10), "top-left");
        assert_eq!(tag(440, 10), "top-center");
        assert_eq!(tag(860, 10), "top-right");
        assert_eq!(tag(10, 440), "middle-left");
        assert_eq!(tag(440, 440), "middle-center");
        assert_eq!(tag(860, 860), "bottom-right");
    }
}
