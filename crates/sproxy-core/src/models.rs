/// Static descriptor table keyed by the public model name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelKind {
    Image {
        width: i64,
        height: i64,
    },
    Video {
        orientation: &'static str,
        n_frames: i64,
        upstream_model: &'static str,
        size: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub kind: ModelKind,
    pub require_pro: bool,
}

impl ModelSpec {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, ModelKind::Video { .. })
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, ModelKind::Image { .. })
    }

    pub fn description(&self) -> String {
        match self.kind {
            ModelKind::Image { width, height } => {
                format!("Image generation - {width}x{height}")
            }
            ModelKind::Video { orientation, .. } => {
                format!("Video generation - {orientation}")
            }
        }
    }
}

const fn image(name: &'static str, width: i64, height: i64) -> ModelSpec {
    ModelSpec {
        name,
        kind: ModelKind::Image { width, height },
        require_pro: false,
    }
}

const fn video(
    name: &'static str,
    orientation: &'static str,
    n_frames: i64,
    upstream_model: &'static str,
    size: &'static str,
    require_pro: bool,
) -> ModelSpec {
    ModelSpec {
        name,
        kind: ModelKind::Video {
            orientation,
            n_frames,
            upstream_model,
            size,
        },
        require_pro,
    }
}

static MODELS: &[ModelSpec] = &[
    image("gpt-image", 360, 360),
    image("gpt-image-landscape", 540, 360),
    image("gpt-image-portrait", 360, 540),
    // 10s / 15s standard tiers.
    video("sora2-landscape-10s", "landscape", 300, "sy_8", "small", false),
    video("sora2-portrait-10s", "portrait", 300, "sy_8", "small", false),
    video("sora2-landscape-15s", "landscape", 450, "sy_8", "small", false),
    video("sora2-portrait-15s", "portrait", 450, "sy_8", "small", false),
    // 25s needs a Pro subscription even on the standard model.
    video("sora2-landscape-25s", "landscape", 750, "sy_8", "small", true),
    video("sora2-portrait-25s", "portrait", 750, "sy_8", "small", true),
    video("sora2pro-landscape-10s", "landscape", 300, "sy_ore", "small", true),
    video("sora2pro-portrait-10s", "portrait", 300, "sy_ore", "small", true),
    video("sora2pro-landscape-15s", "landscape", 450, "sy_ore", "small", true),
    video("sora2pro-portrait-15s", "portrait", 450, "sy_ore", "small", true),
    video("sora2pro-landscape-25s", "landscape", 750, "sy_ore", "small", true),
    video("sora2pro-portrait-25s", "portrait", 750, "sy_ore", "small", true),
    video("sora2pro-hd-landscape-10s", "landscape", 300, "sy_ore", "large", true),
    video("sora2pro-hd-portrait-10s", "portrait", 300, "sy_ore", "large", true),
    video("sora2pro-hd-landscape-15s", "landscape", 450, "sy_ore", "large", true),
    video("sora2pro-hd-portrait-15s", "portrait", 450, "sy_ore", "large", true),
];

pub fn all_models() -> &'static [ModelSpec] {
    MODELS
}

pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_shape() {
        let spec = find_model("gpt-image-landscape").unwrap();
        assert_eq!(spec.kind, ModelKind::Image { width: 540, height: 360 });
        assert!(!spec.require_pro);
        assert!(find_model("gpt-5").is_none());
    }

    #[test]
    fn twenty_five_second_tiers_require_pro() {
        for name in ["sora2-landscape-25s", "sora2-portrait-25s"] {
            let spec = find_model(name).unwrap();
            assert!(spec.require_pro);
            let ModelKind::Video { n_frames, upstream_model, .. } = spec.kind else {
                panic!("expected video spec");
            };
            assert_eq!(n_frames, 750);
            assert_eq!(upstream_model, "sy_8");
        }
    }

    #[test]
    fn pro_hd_uses_large_size() {
        let spec = find_model("sora2pro-hd-portrait-15s").unwrap();
        let ModelKind::Video { size, upstream_model, .. } = spec.kind else {
            panic!("expected video spec");
        };
        assert_eq!(size, "large");
        assert_eq!(upstream_model, "sy_ore");
        assert!(spec.require_pro);
    }

    #[test]
    fn every_model_name_is_unique() {
        let mut names: Vec<_> = all_models().iter().map(|spec| spec.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all_models().len());
    }
}
