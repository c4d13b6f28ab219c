use anyhow::Context;
use bytes::{BufMut, BytesMut};

/// Source field codes understood in `input_format` / `output_format`.
/// Other codes (3 dns server, 7 request type, 14 rcode, ...) are positional only.
pub const CODE_REQUEST_IP: u16 = 1;
pub const CODE_DOMAIN: u16 = 6;
pub const CODE_RESULT: u16 = 15;
/// Derived slots: the source log does not separate A from AAAA answers.
pub const CODE_A_RECORD: u16 = 17;
pub const CODE_AAAA_RECORD: u16 = 18;

/// Position of the resolution record when the layout carries no result column.
const DEFAULT_ANSWER_POSITION: usize = 11;

/// Positional layout of the pipe-delimited source records.
#[derive(Debug, Clone)]
pub struct InputLayout {
    codes: Vec<u16>,
    pub request_ip: usize,
    pub domain: usize,
    pub result: Option<usize>,
    /// Field holding the resolution record used for the A / AAAA split.
    pub answer: usize,
}

impl InputLayout {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut codes = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let code: u16 = part
                .parse()
                .with_context(|| format!("invalid field code in input_format: {part:?}"))?;
            codes.push(code);
        }
        let position = |code: u16| codes.iter().position(|c| *c == code);
        let request_ip = position(CODE_REQUEST_IP)
            .context("input_format must contain the request ip code (1)")?;
        let domain =
            position(CODE_DOMAIN).context("input_format must contain the domain code (6)")?;
        let result = position(CODE_RESULT);
        Ok(Self {
            request_ip,
            domain,
            result,
            answer: result.unwrap_or(DEFAULT_ANSWER_POSITION),
            codes,
        })
    }

    pub fn field_count(&self) -> usize {
        self.codes.len()
    }

    pub fn position_of(&self, code: u16) -> Option<usize> {
        self.codes.iter().position(|c| *c == code)
    }
}

/// One output slot of a field-remap format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    Source(usize),
    ARecord,
    AaaaRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    /// Original line, unmodified.
    PassThrough,
    /// Fixed 12-field layout for the provincial platform consumer.
    Legacy,
    Remap(Vec<FieldSlot>),
}

impl OutputFormat {
    pub fn compile(raw: &str, layout: &InputLayout) -> anyhow::Result<Self> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "" | "full" => return Ok(OutputFormat::PassThrough),
            "legacy" | "jituan" => return Ok(OutputFormat::Legacy),
            _ => {}
        }
        let mut slots = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let code: u16 = part
                .parse()
                .with_context(|| format!("invalid field code in output_format: {part:?}"))?;
            let slot = match code {
                CODE_A_RECORD => FieldSlot::ARecord,
                CODE_AAAA_RECORD => FieldSlot::AaaaRecord,
                _ => FieldSlot::Source(layout.position_of(code).with_context(|| {
                    format!("output field {code} is not part of input_format")
                })?),
            };
            slots.push(slot);
        }
        Ok(OutputFormat::Remap(slots))
    }

    /// Highest source position this format reads, if any.
    pub fn max_position(&self, layout: &InputLayout) -> Option<usize> {
        match self {
            OutputFormat::PassThrough => None,
            OutputFormat::Legacy => Some(layout.answer.max(10)),
            OutputFormat::Remap(slots) => slots
                .iter()
                .map(|s| match s {
                    FieldSlot::Source(i) => *i,
                    FieldSlot::ARecord | FieldSlot::AaaaRecord => layout.answer,
                })
                .max(),
        }
    }

    /// Appends one newline-terminated record to `out`.
    pub fn write_record(&self, line: &str, fields: &[&str], answer: usize, out: &mut BytesMut) {
        match self {
            OutputFormat::PassThrough => {
                out.put_slice(line.as_bytes());
            }
            OutputFormat::Legacy => {
                let (a, aaaa) = split_answer(field(fields, answer));
                let parts = [
                    field(fields, 4),
                    field(fields, 7),
                    field(fields, 1),
                    a,
                    field(fields, 9),
                    field(fields, 8),
                    field(fields, 10),
                    aaaa,
                    field(fields, 2),
                    "0.00",
                    field(fields, 5),
                    "320000",
                ];
                put_joined(out, parts.iter().copied());
            }
            OutputFormat::Remap(slots) => {
                let (a, aaaa) = split_answer(field(fields, answer));
                put_joined(
                    out,
                    slots.iter().map(|slot| match slot {
                        FieldSlot::Source(i) => field(fields, *i),
                        FieldSlot::ARecord => a,
                        FieldSlot::AaaaRecord => aaaa,
                    }),
                );
            }
        }
        out.put_u8(b'\n');
    }
}

#[inline]
pub fn field<'a>(fields: &[&'a str], idx: usize) -> &'a str {
    fields.get(idx).copied().unwrap_or("")
}

/// Classifies a resolution record: values containing ':' are AAAA answers.
#[inline]
pub fn split_answer(value: &str) -> (&str, &str) {
    if value.contains(':') {
        ("", value)
    } else {
        (value, "")
    }
}

fn put_joined<'a>(out: &mut BytesMut, parts: impl Iterator<Item = &'a str>) {
    for (i, part) in parts.enumerate() {
        if i > 0 {
            out.put_u8(b'|');
        }
        out.put_slice(part.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = "0,1,2,3,4,5,6,7,8,9,14,15";

    fn layout() -> InputLayout {
        InputLayout::parse(LAYOUT).unwrap()
    }

    fn render(format: &OutputFormat, line: &str) -> String {
        let fields: Vec<&str> = line.split('|').collect();
        let mut out = BytesMut::new();
        format.write_record(line, &fields, layout().answer, &mut out);
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn layout_positions() {
        let l = layout();
        assert_eq!(l.request_ip, 1);
        assert_eq!(l.domain, 6);
        assert_eq!(l.result, Some(11));
        assert_eq!(l.position_of(14), Some(10));
        assert_eq!(l.position_of(99), None);
        assert_eq!(l.answer, 11);
        assert_eq!(l.field_count(), 12);
    }

    #[test]
    fn layout_requires_core_fields() {
        assert!(InputLayout::parse("0,2,6").is_err());
        assert!(InputLayout::parse("1,2,3").is_err());
        assert!(InputLayout::parse("1,x,6").is_err());
        let l = InputLayout::parse("6,1").unwrap();
        assert_eq!(l.answer, DEFAULT_ANSWER_POSITION);
    }

    #[test]
    fn pass_through_keeps_line() {
        let line = "t|1.2.3.4|a|b|c|d|example.com|A|e|f|NOERROR|93.184.216.34";
        let fmt = OutputFormat::compile("full", &layout()).unwrap();
        assert_eq!(render(&fmt, line), format!("{line}\n"));
    }

    #[test]
    fn remap_reproduces_configured_fields_in_order() {
        let line = "t|1.2.3.4|a|8.8.8.8|c|d|example.com|AAAA|e|f|NOERROR|93.184.216.34";
        let fmt = OutputFormat::compile("6,1,3,7,14", &layout()).unwrap();
        assert_eq!(
            fmt,
            OutputFormat::Remap(vec![
                FieldSlot::Source(6),
                FieldSlot::Source(1),
                FieldSlot::Source(3),
                FieldSlot::Source(7),
                FieldSlot::Source(10),
            ])
        );
        assert_eq!(render(&fmt, line), "example.com|1.2.3.4|8.8.8.8|AAAA|NOERROR\n");
    }

    #[test]
    fn remap_splits_a_and_aaaa_answers() {
        let fmt = OutputFormat::compile("6,17,18", &layout()).unwrap();
        let v4 = "t|1.2.3.4|a|b|c|d|example.com|A|e|f|NOERROR|93.184.216.34";
        assert_eq!(render(&fmt, v4), "example.com|93.184.216.34|\n");
        let v6 = "t|1.2.3.4|a|b|c|d|example.com|AAAA|e|f|NOERROR|2606:2800::1";
        assert_eq!(render(&fmt, v6), "example.com||2606:2800::1\n");
    }

    #[test]
    fn legacy_layout_has_twelve_fields() {
        let fmt = OutputFormat::compile("jituan", &layout()).unwrap();
        let line = "f0|f1|f2|f3|f4|f5|f6|f7|f8|f9|f10|1.1.1.1";
        assert_eq!(
            render(&fmt, line),
            "f4|f7|f1|1.1.1.1|f9|f8|f10||f2|0.00|f5|320000\n"
        );
        let out = render(&fmt, line);
        assert_eq!(out.trim_end().split('|').count(), 12);
    }

    #[test]
    fn unknown_output_code_is_rejected() {
        assert!(OutputFormat::compile("6,99", &layout()).is_err());
        assert!(OutputFormat::compile("6,,1", &layout()).is_err());
    }

    #[test]
    fn short_records_render_empty_fields() {
        let fmt = OutputFormat::compile("6,1,15", &layout()).unwrap();
        let line = "t|1.2.3.4";
        assert_eq!(render(&fmt, line), "|1.2.3.4|\n");
    }

    #[test]
    fn max_position_covers_derived_slots() {
        let l = layout();
        let fmt = OutputFormat::compile("1,17", &l).unwrap();
        assert_eq!(fmt.max_position(&l), Some(11));
        assert_eq!(OutputFormat::PassThrough.max_position(&l), None);
    }
}
