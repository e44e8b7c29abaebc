use anyhow::{Context, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// 缩略图间距（像素）
const GAP: u32 = 4;

/// 把选中的帧按抽取顺序拼成网格预览图，和评测流程互不依赖
pub fn build_contact_sheet(frames: &[PathBuf], thumb_width: u32) -> Result<RgbImage> {
    if frames.is_empty() {
        anyhow::bail!("没有可拼接的帧");
    }
    let thumb_width = thumb_width.max(1);

    let thumbs = frames
        .iter()
        .map(|path| {
            let img = image::open(path).with_context(|| format!("读取帧失败: {}", path.display()))?;
            let height = ((img.height() as f64 * thumb_width as f64 / img.width().max(1) as f64).round() as u32).max(1);
            Ok(img.resize_exact(thumb_width, height, FilterType::Triangle).to_rgb8())
        })
        .collect::<Result<Vec<_>>>()?;

    let (columns, rows) = grid_shape(thumbs.len());
    let cell_height = thumbs.iter().map(|t| t.height()).max().unwrap_or(1);
    let width = columns * thumb_width + (columns + 1) * GAP;
    let height = rows * cell_height + (rows + 1) * GAP;

    let mut sheet = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    for (i, thumb) in thumbs.iter().enumerate() {
        let col = i as u32 % columns;
        let row = i as u32 / columns;
        let x = GAP + col * (thumb_width + GAP);
        let y = GAP + row * (cell_height + GAP);
        imageops::overlay(&mut sheet, thumb, x as i64, y as i64);
    }
    Ok(sheet)
}

/// 近似正方形的网格：列数 = ceil(sqrt(n))
fn grid_shape(count: usize) -> (u32, u32) {
    let columns = (count as f64).sqrt().ceil().max(1.0) as u32;
    let rows = (count as u32).div_ceil(columns);
    (columns, rows)
}

pub fn save_contact_sheet(frames: &[PathBuf], thumb_width: u32, output: &Path) -> Result<()> {
    let sheet = build_contact_sheet(frames, thumb_width)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    sheet
        .save(output)
        .with_context(|| format!("保存预览图失败: {}", output.display()))
}
