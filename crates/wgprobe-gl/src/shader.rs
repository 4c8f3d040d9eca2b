//! GLSL template instantiation.

use wgprobe_core::dispatch::DispatchGeometry;

/// Integer values substituted into the compute shader template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateParams {
    pub geometry: DispatchGeometry,
    pub variable_group_size: bool,
}

impl TemplateParams {
    fn bindings(&self) -> [(&'static str, u32); 7] {
        let e = self.geometry.extents;
        let w = self.geometry.workgroup;
        [
            ("WIDTH", e.width),
            ("HEIGHT", e.height),
            ("DEPTH", e.depth),
            ("WORKGROUP_SIZE_X", w.x),
            ("WORKGROUP_SIZE_Y", w.y),
            ("WORKGROUP_SIZE_Z", w.z),
            ("USE_VARIABLE_GROUP_SIZE", u32::from(self.variable_group_size)),
        ]
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace every template token that stands as a whole identifier.
///
/// `WIDTH` inside `MAX_WIDTH` or `WIDTHS` is left alone.
pub fn instantiate(template: &str, params: &TemplateParams) -> String {
    let bindings = params.bindings();
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        if !is_ident_byte(bytes[i]) {
            let start = i;
            while i < bytes.len() && !is_ident_byte(bytes[i]) {
                i += 1;
            }
            out.push_str(&template[start..i]);
            continue;
        }
        let start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        let word = &template[start..i];
        match bindings.iter().find(|(name, _)| *name == word) {
            Some((_, value)) => out.push_str(&value.to_string()),
            None => out.push_str(word),
        }
    }
    out
}
