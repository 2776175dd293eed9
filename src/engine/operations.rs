use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Blur strength users pick in the editor maps to a visibly weaker engine
/// sigma, so the requested radius is scaled before it is emitted.
pub const BLUR_SIGMA_MULTIPLIER: f64 = 3.0;

pub const DEFAULT_QUALITY: i64 = 85;

const COLORSPACES: &[&str] = &["Gray", "sRGB", "RGB", "CMYK", "HSL", "LAB"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation: String,
    #[serde(default)]
    pub params: OperationParams,
}

impl Operation {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: OperationParams::default(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params = self.params.with(key, value);
        self
    }

    pub fn quality(value: u8) -> Self {
        Self::new("quality").with("value", i64::from(value))
    }
}

/// Operation parameters as they arrive on the wire. Numeric fields accept JSON
/// numbers as well as numeric strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationParams(Map<String, Value>);

impl OperationParams {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v.trunc() as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
            }
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.f64(key).unwrap_or(default)
    }

    fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.i64(key).unwrap_or(default)
    }
}

pub type CompileFn = fn(&OperationParams) -> Vec<String>;

#[derive(Debug, Clone, Copy)]
pub struct OperationEntry {
    pub name: &'static str,
    pub compile: CompileFn,
}

const fn entry(name: &'static str, compile: CompileFn) -> OperationEntry {
    OperationEntry { name, compile }
}

pub const DISPATCH_TABLE: &[OperationEntry] = &[
    entry("resize", resize),
    entry("crop", crop),
    entry("crop-aspect", crop_aspect),
    entry("rotate", rotate),
    entry("flip", |_| flag("-flip")),
    entry("flop", |_| flag("-flop")),
    entry("transpose", |_| flag("-transpose")),
    entry("transverse", |_| flag("-transverse")),
    entry("quality", quality),
    entry("strip", |_| flag("-strip")),
    entry("blur", blur),
    entry("sharpen", sharpen),
    entry("grayscale", |_| tokens(&["-colorspace", "Gray"])),
    entry("sepia-tone", sepia_tone),
    entry("negate", |_| flag("-negate")),
    entry("modulate", modulate),
    entry("brightness-contrast", brightness_contrast),
    entry("auto-level", |_| flag("-auto-level")),
    entry("auto-gamma", |_| flag("-auto-gamma")),
    entry("normalize", |_| flag("-normalize")),
    entry("enhance", |_| {
        tokens(&[
            "-normalize",
            "-modulate",
            "100,110,100",
            "-unsharp",
            "0x0.5+0.5+0.008",
        ])
    }),
    entry("auto-orient", |_| flag("-auto-orient")),
    entry("annotate", annotate),
    entry("watermark", annotate),
    entry("trim", |_| tokens(&["-trim", "+repage"])),
    entry("transparent", transparent),
    entry("despeckle", |_| flag("-despeckle")),
    entry("deskew", deskew),
    entry("gamma", gamma),
    entry("border", border),
    entry("colorspace", colorspace),
];

/// Looks up an already normalized operation name.
pub fn lookup(name: &str) -> Option<&'static OperationEntry> {
    DISPATCH_TABLE.iter().find(|entry| entry.name == name)
}

fn flag(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Formats a float with at least one decimal place: `90.0`, `-12.5`.
pub fn fmt_decimal(value: f64) -> String {
    format!("{value:?}")
}

fn resize(params: &OperationParams) -> Vec<String> {
    let width = params.i64_or("width", 0);
    let height = params.i64_or("height", 0);
    if width > 0 && height > 0 {
        let suffix = match params.str("mode") {
            Some("force") => "!",
            Some("fill") => "^",
            _ => "",
        };
        return vec![
            String::from("-resize"),
            format!("{width}x{height}{suffix}"),
        ];
    }
    match params.i64("percent") {
        Some(percent) if percent != 0 => vec![String::from("-resize"), format!("{percent}%")],
        _ => Vec::new(),
    }
}

fn crop(params: &OperationParams) -> Vec<String> {
    let width = params.i64_or("width", 0);
    let height = params.i64_or("height", 0);
    if width <= 0 || height <= 0 {
        return Vec::new();
    }
    let x = params.i64_or("x", 0);
    let y = params.i64_or("y", 0);
    vec![
        String::from("-crop"),
        format!("{width}x{height}{x:+}{y:+}"),
        String::from("+repage"),
    ]
}

fn crop_aspect(params: &OperationParams) -> Vec<String> {
    let aspect_w = params.i64_or("aspect_w", 1).max(1);
    let aspect_h = params.i64_or("aspect_h", 1).max(1);
    vec![
        String::from("-gravity"),
        String::from("center"),
        String::from("-crop"),
        format!("{aspect_w}:{aspect_h}"),
        String::from("+repage"),
    ]
}

fn rotate(params: &OperationParams) -> Vec<String> {
    vec![
        String::from("-rotate"),
        fmt_decimal(params.f64_or("angle", 0.0)),
    ]
}

fn quality(params: &OperationParams) -> Vec<String> {
    let value = params.i64_or("value", DEFAULT_QUALITY).clamp(1, 100);
    vec![String::from("-quality"), value.to_string()]
}

fn blur(params: &OperationParams) -> Vec<String> {
    let radius = params
        .f64("sigma")
        .or_else(|| params.f64("radius"))
        .unwrap_or(0.0);
    let sigma = radius * BLUR_SIGMA_MULTIPLIER;
    if sigma <= 0.0 {
        return Vec::new();
    }
    vec![String::from("-gaussian-blur"), format!("0x{sigma:.1}")]
}

fn sharpen(params: &OperationParams) -> Vec<String> {
    let radius = params.f64_or("radius", 0.0);
    let sigma = params.f64_or("sigma", 1.0);
    vec![
        String::from("-sharpen"),
        format!("{}x{}", fmt_decimal(radius), fmt_decimal(sigma)),
    ]
}

fn sepia_tone(params: &OperationParams) -> Vec<String> {
    let threshold = params.f64_or("threshold", 80.0);
    vec![
        String::from("-sepia-tone"),
        format!("{}%", fmt_decimal(threshold)),
    ]
}

fn modulate(params: &OperationParams) -> Vec<String> {
    let brightness = params.i64_or("brightness", 100);
    let saturation = params.i64_or("saturation", 100);
    let hue = params.i64_or("hue", 100);
    vec![
        String::from("-modulate"),
        format!("{brightness},{saturation},{hue}"),
    ]
}

fn brightness_contrast(params: &OperationParams) -> Vec<String> {
    let brightness = params.i64_or("brightness", 0);
    let contrast = params.i64_or("contrast", 0);
    vec![
        String::from("-brightness-contrast"),
        format!("{brightness}x{contrast}"),
    ]
}

fn gravity_for(position: &str) -> &'static str {
    match position.to_lowercase().as_str() {
        "northwest" => "NorthWest",
        "north" => "North",
        "northeast" => "NorthEast",
        "west" => "West",
        "center" => "Center",
        "east" => "East",
        "southwest" => "SouthWest",
        "south" => "South",
        _ => "SouthEast",
    }
}

fn annotate(params: &OperationParams) -> Vec<String> {
    let text: String = params
        .str("text")
        .unwrap_or_default()
        .chars()
        .filter(|ch| !matches!(ch, '`' | '$' | '\\'))
        .collect();
    // A leading `@` makes the engine read the text from a file.
    let text = text.trim_start_matches('@');
    if text.is_empty() {
        return Vec::new();
    }

    let gravity = gravity_for(params.str("position").unwrap_or("southeast"));
    let font_size = params.i64_or("font_size", 24).max(1);
    let opacity = params.f64_or("opacity", 0.5).clamp(0.0, 1.0);
    let shadow = ((font_size as f64) * 0.05).floor().max(2.0) as i64;
    let margin = ((font_size as f64) * 0.4).floor().max(10.0) as i64;
    let shadow_offset = margin + shadow;
    let opacity = fmt_decimal(opacity);

    vec![
        String::from("-gravity"),
        gravity.to_string(),
        String::from("-pointsize"),
        font_size.to_string(),
        String::from("-fill"),
        format!("rgba(0,0,0,{opacity})"),
        String::from("-annotate"),
        format!("+{shadow_offset}+{shadow_offset}"),
        text.to_string(),
        String::from("-fill"),
        format!("rgba(255,255,255,{opacity})"),
        String::from("-annotate"),
        format!("+{margin}+{margin}"),
        text.to_string(),
    ]
}

/// Accepts an alphabetic color name or `#` followed by 3, 4, 6 or 8 hex
/// digits. A bare hex string gets the `#` prefix.
fn validated_color(raw: &str) -> Option<String> {
    let color = raw.trim().to_lowercase();
    if !color.is_empty() && color.len() <= 32 && color.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Some(color);
    }
    let digits = color.strip_prefix('#').unwrap_or(color.as_str());
    if matches!(digits.len(), 3 | 4 | 6 | 8) && digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Some(format!("#{digits}"));
    }
    None
}

fn transparent(params: &OperationParams) -> Vec<String> {
    let fuzz = params.i64_or("fuzz", 10).clamp(0, 100);
    let requested = params.str("color").unwrap_or("white").trim().to_lowercase();
    let tail = if requested == "auto" {
        tokens(&["-fill", "none", "-draw", "color 0,0 floodfill"])
    } else {
        match validated_color(requested.as_str()) {
            Some(color) => vec![String::from("-transparent"), color],
            None => return Vec::new(),
        }
    };

    let mut group = vec![
        String::from("-alpha"),
        String::from("set"),
        String::from("-fuzz"),
        format!("{fuzz}%"),
    ];
    group.extend(tail);
    group
}

fn deskew(params: &OperationParams) -> Vec<String> {
    let threshold = params.f64_or("threshold", 40.0).clamp(0.0, 100.0);
    vec![
        String::from("-deskew"),
        format!("{}%", fmt_decimal(threshold)),
    ]
}

fn gamma(params: &OperationParams) -> Vec<String> {
    let value = params.f64_or("value", 1.0);
    if value <= 0.0 {
        return Vec::new();
    }
    vec![String::from("-gamma"), fmt_decimal(value)]
}

fn border(params: &OperationParams) -> Vec<String> {
    let width = params.i64_or("width", 0);
    if width <= 0 {
        return Vec::new();
    }
    let Some(color) = validated_color(params.str("color").unwrap_or("black")) else {
        return Vec::new();
    };
    vec![
        String::from("-bordercolor"),
        color,
        String::from("-border"),
        width.to_string(),
    ]
}

fn colorspace(params: &OperationParams) -> Vec<String> {
    let requested = params.str("name").unwrap_or("sRGB").trim();
    COLORSPACES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(requested))
        .map(|known| vec![String::from("-colorspace"), known.to_string()])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(op: Operation) -> Vec<String> {
        let entry = lookup(op.operation.as_str()).expect("operation should be in the table");
        (entry.compile)(&op.params)
    }

    #[test]
    fn resize_modes_map_to_geometry_suffixes() {
        let base = Operation::new("resize").with("width", 800).with("height", 600);
        assert_eq!(compile(base.clone().with("mode", "force")), ["-resize", "800x600!"]);
        assert_eq!(compile(base.clone().with("mode", "fill")), ["-resize", "800x600^"]);
        assert_eq!(compile(base.clone().with("mode", "fit")), ["-resize", "800x600"]);
        assert_eq!(compile(base), ["-resize", "800x600"]);
    }

    #[test]
    fn resize_falls_back_to_percent_or_nothing() {
        assert_eq!(
            compile(Operation::new("resize").with("percent", "50")),
            ["-resize", "50%"]
        );
        assert!(compile(Operation::new("resize").with("width", 10)).is_empty());
    }

    #[test]
    fn blur_scales_radius_into_sigma() {
        assert_eq!(
            compile(Operation::new("blur").with("radius", 10)),
            ["-gaussian-blur", "0x30.0"]
        );
        assert_eq!(
            compile(Operation::new("blur").with("sigma", "1.5")),
            ["-gaussian-blur", "0x4.5"]
        );
        assert!(compile(Operation::new("blur").with("radius", 0)).is_empty());
    }

    #[test]
    fn rotate_and_crop_format_numbers() {
        assert_eq!(compile(Operation::new("rotate").with("angle", 90)), ["-rotate", "90.0"]);
        assert_eq!(
            compile(Operation::new("rotate").with("angle", "-12.5")),
            ["-rotate", "-12.5"]
        );
        assert_eq!(
            compile(
                Operation::new("crop")
                    .with("width", 100)
                    .with("height", 50)
                    .with("x", 5)
                    .with("y", -3)
            ),
            ["-crop", "100x50+5-3", "+repage"]
        );
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(compile(Operation::quality(0)), ["-quality", "1"]);
        assert_eq!(compile(Operation::new("quality").with("value", 400)), ["-quality", "100"]);
        assert_eq!(compile(Operation::new("quality")), ["-quality", "85"]);
    }

    #[test]
    fn annotate_emits_shadow_then_text() {
        let group = compile(
            Operation::new("watermark")
                .with("text", "(c) $Studio`")
                .with("position", "NorthWest")
                .with("font_size", 60)
                .with("opacity", 2.0),
        );
        assert_eq!(
            group,
            [
                "-gravity",
                "NorthWest",
                "-pointsize",
                "60",
                "-fill",
                "rgba(0,0,0,1.0)",
                "-annotate",
                "+27+27",
                "(c) Studio",
                "-fill",
                "rgba(255,255,255,1.0)",
                "-annotate",
                "+24+24",
                "(c) Studio",
            ]
        );
        assert!(compile(Operation::new("annotate").with("text", "$`")).is_empty());
    }

    #[test]
    fn annotate_never_reads_text_from_a_file() {
        let group = compile(Operation::new("annotate").with("text", "@@/etc/passwd"));
        assert_eq!(group[8], "/etc/passwd");
        assert_eq!(group[13], "/etc/passwd");
        assert!(group.iter().all(|token| !token.starts_with('@')));
        assert!(compile(Operation::new("watermark").with("text", "@")).is_empty());
    }

    #[test]
    fn annotate_defaults_to_south_east() {
        let group = compile(
            Operation::new("annotate")
                .with("text", "hi")
                .with("position", "somewhere"),
        );
        assert_eq!(group[1], "SouthEast");
        assert_eq!(group[7], "+12+12");
    }

    #[test]
    fn transparent_validates_colors() {
        assert_eq!(
            compile(Operation::new("transparent").with("color", "auto").with("fuzz", 150)),
            ["-alpha", "set", "-fuzz", "100%", "-fill", "none", "-draw", "color 0,0 floodfill"]
        );
        assert_eq!(
            compile(Operation::new("transparent").with("color", "00FF00")),
            ["-alpha", "set", "-fuzz", "10%", "-transparent", "#00ff00"]
        );
        assert_eq!(
            compile(Operation::new("transparent")),
            ["-alpha", "set", "-fuzz", "10%", "-transparent", "white"]
        );
        assert!(compile(Operation::new("transparent").with("color", "#12' -write x")).is_empty());
    }

    #[test]
    fn supplemental_operations() {
        assert_eq!(
            compile(Operation::new("colorspace").with("name", "cmyk")),
            ["-colorspace", "CMYK"]
        );
        assert!(compile(Operation::new("colorspace").with("name", "XYZ")).is_empty());
        assert_eq!(
            compile(Operation::new("border").with("width", 4).with("color", "#fff")),
            ["-bordercolor", "#fff", "-border", "4"]
        );
        assert_eq!(compile(Operation::new("gamma").with("value", 2.2)), ["-gamma", "2.2"]);
        assert_eq!(
            compile(Operation::new("crop-aspect").with("aspect_w", 16).with("aspect_h", 9)),
            ["-gravity", "center", "-crop", "16:9", "+repage"]
        );
    }

    #[test]
    fn params_deserialize_from_wire_shape() {
        let ops: Vec<Operation> = serde_json::from_value(json!([
            {"operation": "resize", "params": {"width": "640", "height": 480.0}},
            {"operation": "flip"}
        ]))
        .expect("operations should deserialize");
        assert_eq!(ops[0].params.i64("width"), Some(640));
        assert_eq!(ops[0].params.i64("height"), Some(480));
        assert!(ops[1].params.get("anything").is_none());
    }
}
