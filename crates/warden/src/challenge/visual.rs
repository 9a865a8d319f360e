//! Distorted-image puzzles.
//!
//! The prompt is a number, a short string, or a small arithmetic expression,
//! drawn glyph by glyph with random rotation and color over background noise
//! (random line strokes plus speckle) to defeat naive OCR. The literal answer
//! never leaves the server; only the PNG does.

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_line_segment_mut, draw_text_mut};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use rand::Rng;

use gatehouse_common::WardenError;

const WIDTH: u32 = 300;
const HEIGHT: u32 = 120;

/// Ambiguous glyphs (I/1, O/0) are left out.
const TEXT_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub(crate) struct VisualPrompt {
    /// What the user must type (verified case-insensitively).
    pub answer: String,
    /// What gets drawn on the image.
    pub text: String,
}

pub(crate) fn number_prompt<R: Rng + ?Sized>(rng: &mut R) -> VisualPrompt {
    let n: i64 = rng.random_range(1..=50);
    VisualPrompt {
        answer: n.to_string(),
        text: n.to_string(),
    }
}

pub(crate) fn text_prompt<R: Rng + ?Sized>(rng: &mut R) -> VisualPrompt {
    let word: String = (0..4)
        .map(|_| TEXT_CHARSET[rng.random_range(0..TEXT_CHARSET.len())] as char)
        .collect();
    VisualPrompt {
        answer: word.clone(),
        text: word,
    }
}

pub(crate) fn math_prompt<R: Rng + ?Sized>(rng: &mut R) -> VisualPrompt {
    match rng.random_range(0..3) {
        0 => {
            let a: i64 = rng.random_range(1..=20);
            let b: i64 = rng.random_range(1..=10);
            VisualPrompt {
                answer: (a + b).to_string(),
                text: format!("{a}+{b}"),
            }
        }
        1 => {
            let mut a: i64 = rng.random_range(1..=20);
            let mut b: i64 = rng.random_range(1..=10);
            if a < b {
                std::mem::swap(&mut a, &mut b);
            }
            VisualPrompt {
                answer: (a - b).to_string(),
                text: format!("{a}-{b}"),
            }
        }
        _ => {
            let a: i64 = rng.random_range(1..=10);
            let b: i64 = rng.random_range(1..=9);
            VisualPrompt {
                answer: (a * b).to_string(),
                text: format!("{a}×{b}"),
            }
        }
    }
}

pub(crate) fn random_prompt<R: Rng + ?Sized>(rng: &mut R) -> VisualPrompt {
    match rng.random_range(0..3) {
        0 => number_prompt(rng),
        1 => text_prompt(rng),
        _ => math_prompt(rng),
    }
}

/// Rasterize `text` into a noisy PNG.
pub(crate) fn render<R: Rng + ?Sized>(
    font: &FontArc,
    text: &str,
    rng: &mut R,
) -> Result<Vec<u8>, WardenError> {
    let mut img = RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([255, 255, 255, 255]));

    // Light background strokes.
    for _ in 0..8 {
        let start = (
            rng.random_range(0..WIDTH) as f32,
            rng.random_range(0..HEIGHT) as f32,
        );
        let end = (
            rng.random_range(0..WIDTH) as f32,
            rng.random_range(0..HEIGHT) as f32,
        );
        let shade = Rgba([
            rng.random_range(160..=200),
            rng.random_range(160..=200),
            rng.random_range(160..=200),
            255,
        ]);
        draw_line_segment_mut(&mut img, start, end, shade);
    }

    // Speckle.
    for _ in 0..500 {
        let x = rng.random_range(0..WIDTH);
        let y = rng.random_range(0..HEIGHT);
        img.put_pixel(
            x,
            y,
            Rgba([
                rng.random_range(0..=255),
                rng.random_range(0..=255),
                rng.random_range(0..=255),
                255,
            ]),
        );
    }

    // Each glyph gets its own rotation, color and vertical jitter.
    let glyph_count = text.chars().count() as u32;
    let spacing = (WIDTH / (glyph_count + 2)) as i64;
    let mut x_offset = spacing;

    for ch in text.chars() {
        let mut glyph = RgbaImage::from_pixel(40, 50, Rgba([0, 0, 0, 0]));
        let color = Rgba([
            rng.random_range(0..=100),
            rng.random_range(0..=100),
            rng.random_range(0..=100),
            255,
        ]);
        let scale = PxScale::from(rng.random_range(36..=42) as f32);
        draw_text_mut(&mut glyph, color, 5, 5, scale, font, &ch.to_string());

        let degrees = rng.random_range(-15..=15) as f32;
        let rotated = rotate_about_center(
            &glyph,
            degrees.to_radians(),
            Interpolation::Bilinear,
            Rgba([0, 0, 0, 0]),
        );

        let y = rng.random_range((HEIGHT / 4)..=(HEIGHT / 2)) as i64;
        image::imageops::overlay(&mut img, &rotated, x_offset, y);

        x_offset += spacing + rng.random_range(-10..=10);
    }

    // Strike-through lines over the glyphs.
    for _ in 0..4 {
        let start_y = rng.random_range((HEIGHT / 3)..=(2 * HEIGHT / 3)) as f32;
        let end_y = rng.random_range((HEIGHT / 3)..=(2 * HEIGHT / 3)) as f32;
        let shade = Rgba([
            rng.random_range(0..=150),
            rng.random_range(0..=150),
            rng.random_range(0..=150),
            255,
        ]);
        draw_line_segment_mut(&mut img, (0.0, start_y), (WIDTH as f32, end_y), shade);
        draw_line_segment_mut(
            &mut img,
            (0.0, start_y + 1.0),
            (WIDTH as f32, end_y + 1.0),
            shade,
        );
    }

    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| WardenError::Challenge(format!("png encode failed: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_prompts_stay_in_range() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let prompt = number_prompt(&mut rng);
            let n: i64 = prompt.answer.parse().unwrap();
            assert!((1..=50).contains(&n));
            assert_eq!(prompt.answer, prompt.text);
        }
    }

    #[test]
    fn text_prompts_use_the_unambiguous_charset() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let prompt = text_prompt(&mut rng);
            assert_eq!(prompt.answer.len(), 4);
            for b in prompt.answer.bytes() {
                assert!(TEXT_CHARSET.contains(&b), "unexpected glyph {}", b as char);
            }
        }
    }

    #[test]
    fn math_prompts_carry_the_expression_result() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let prompt = math_prompt(&mut rng);
            let expected: i64 = prompt.answer.parse().unwrap();
            assert!(expected >= 0);

            let computed = if let Some((a, b)) = prompt.text.split_once('+') {
                a.parse::<i64>().unwrap() + b.parse::<i64>().unwrap()
            } else if let Some((a, b)) = prompt.text.split_once('-') {
                a.parse::<i64>().unwrap() - b.parse::<i64>().unwrap()
            } else if let Some((a, b)) = prompt.text.split_once('×') {
                a.parse::<i64>().unwrap() * b.parse::<i64>().unwrap()
            } else {
                panic!("unrecognized expression: {}", prompt.text);
            };
            assert_eq!(computed, expected);
        }
    }
}
