/// 丢掉末尾 `count` 个元素（不足时返回空）
pub fn trim_trailing<T>(frames: &[T], count: usize) -> &[T] {
    &frames[..frames.len().saturating_sub(count)]
}

/// 在 `[0, available - 1]` 上线性插值取 `max_count` 个下标，四舍五入
///
/// `available <= max_count` 时返回全部下标。
pub fn evenly_spaced_indices(available: usize, max_count: usize) -> Vec<usize> {
    if available <= max_count {
        return (0..available).collect();
    }
    if max_count == 0 {
        return Vec::new();
    }
    if max_count == 1 {
        return vec![0];
    }

    let last = (available - 1) as f64;
    let steps = (max_count - 1) as f64;
    (0..max_count)
        .map(|i| (i as f64 * last / steps).round() as usize)
        .collect()
}

/// 从有序帧列表中均匀选出至多 `max_count` 帧，保持原顺序
pub fn select_frames<T: Clone>(frame_files: &[T], max_count: usize) -> Vec<T> {
    evenly_spaced_indices(frame_files.len(), max_count)
        .into_iter()
        .map(|i| frame_files[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_exact_count_covering_span() {
        for available in 1..=60usize {
            for requested in 1..=available {
                let picked = evenly_spaced_indices(available, requested);
                assert_eq!(picked.len(), requested, "M={} N={}", available, requested);
                assert!(picked.windows(2).all(|w| w[0] < w[1]), "M={} N={}", available, requested);
                assert_eq!(picked[0], 0);
                if requested >= 2 {
                    assert_eq!(*picked.last().unwrap(), available - 1);
                }
            }
        }
    }

    #[test]
    fn test_fewer_frames_pass_through() {
        let frames = vec!["0.jpg", "1.jpg", "2.jpg"];
        assert_eq!(select_frames(&frames, 8), frames);
        assert_eq!(select_frames(&frames, 3), frames);
    }

    #[test]
    fn test_select_frames_values() {
        let frames: Vec<usize> = (0..10).collect();
        assert_eq!(select_frames(&frames, 4), vec![0, 3, 6, 9]);
        assert_eq!(select_frames(&frames, 1), vec![0]);
        assert!(select_frames(&frames, 0).is_empty());
    }

    #[test]
    fn test_trim_trailing() {
        let frames = [1, 2, 3, 4];
        assert_eq!(trim_trailing(&frames, 2), &[1, 2]);
        assert_eq!(trim_trailing(&frames, 0), &frames);
        assert!(trim_trailing(&frames, 9).is_empty());
    }
}
