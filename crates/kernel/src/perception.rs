//! Structured perception: turn a uiautomator XML dump into an ordered,
//! de-duplicated list of interactive elements.
//!
//! Pipeline, one pass from the root:
//! 1. collect candidates — interactive nodes (clickable / long-clickable /
//!    focusable) plus text-bearing leaves without an interactive ancestor;
//! 2. filter container wrappers by asymmetric IoU;
//! 3. de-overlap by standard IoU after sorting row-major by center;
//! 4. assign 1-based indices in sort order.
//!
//! PC clients send pre-extracted elements instead of XML; those skip
//! straight to the indexing step.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;

use fg_devices::channel::{RemoteElement, Screen};

/// Pixel bounding box, `[x1,y1][x2,y2]` in uiautomator notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BoundingBox {
    pub fn center(&self) -> (i64, i64) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    pub fn area(&self) -> i64 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }
}

/// `(iou_a, iou_b, iou)`: intersection over each area and over the union.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> (f64, f64, f64) {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 < x1 || y2 < y1 {
        return (0.0, 0.0, 0.0);
    }
    let intersection = ((x2 - x1) * (y2 - y1)) as f64;
    let area_a = a.area() as f64;
    let area_b = b.area() as f64;
    let union = area_a + area_b - intersection;
    (
        if area_a > 0.0 { intersection / area_a } else { 0.0 },
        if area_b > 0.0 { intersection / area_b } else { 0.0 },
        if union > 0.0 { intersection / union } else { 0.0 },
    )
}

/// Parse `"[x1,y1][x2,y2]"`. Degenerate boxes are rejected.
pub fn parse_bounds(raw: &str) -> Option<BoundingBox> {
    let cleaned = raw.replace("][", ",");
    let cleaned = cleaned.trim_matches(|c| c == '[' || c == ']');
    let mut parts = cleaned.split(',').map(|p| p.trim().parse::<i64>());
    let x1 = parts.next()?.ok()?;
    let y1 = parts.next()?.ok()?;
    let x2 = parts.next()?.ok()?;
    let y2 = parts.next()?.ok()?;
    if x1 >= x2 || y1 >= y2 {
        return None;
    }
    Some(BoundingBox { x1, y1, x2, y2 })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node arena
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone)]
struct Node {
    text: String,
    content_desc: String,
    class_name: String,
    clickable: bool,
    long_clickable: bool,
    focusable: bool,
    enabled: bool,
    bounds: Option<BoundingBox>,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl Node {
    fn is_interactive(&self) -> bool {
        self.enabled && (self.clickable || self.long_clickable || self.focusable)
    }

    fn display_text(&self) -> &str {
        if !self.text.is_empty() {
            &self.text
        } else {
            &self.content_desc
        }
    }
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn has_interactive_ancestor(&self, mut idx: usize) -> bool {
        while let Some(parent) = self.nodes[idx].parent {
            if self.nodes[parent].is_interactive() {
                return true;
            }
            idx = parent;
        }
        false
    }

    /// Space-joined text of a node and its non-interactive descendants,
    /// up to `depth` levels down.
    fn aggregate_text(&self, idx: usize, depth: u32) -> String {
        let node = &self.nodes[idx];
        if depth == 0 {
            return node.display_text().to_owned();
        }
        let mut parts: Vec<String> = Vec::new();
        if !node.display_text().is_empty() {
            parts.push(node.display_text().to_owned());
        }
        for &child in &node.children {
            if self.nodes[child].is_interactive() {
                continue; // that text belongs to the child's own entry
            }
            let text = self.aggregate_text(child, depth - 1);
            if !text.is_empty() {
                parts.push(text);
            }
        }
        parts.join(" ").trim().to_owned()
    }
}

/// Parse the uiautomator XML into a node arena.
fn parse_tree(xml: &str) -> Option<Tree> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut nodes: Vec<Node> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    let mut push_node = |nodes: &mut Vec<Node>,
                         stack: &[usize],
                         e: &quick_xml::events::BytesStart<'_>|
     -> usize {
        let mut node = Node {
            enabled: true,
            parent: stack.last().copied(),
            ..Default::default()
        };
        for attr in e.attributes().flatten() {
            let key = attr.key.as_ref();
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            match key {
                b"text" => node.text = value.trim().to_owned(),
                b"content-desc" => node.content_desc = value.trim().to_owned(),
                b"class" => node.class_name = value,
                b"clickable" => node.clickable = value == "true",
                b"long-clickable" => node.long_clickable = value == "true",
                b"focusable" => node.focusable = value == "true",
                b"enabled" => node.enabled = value != "false",
                b"bounds" => node.bounds = parse_bounds(&value),
                _ => {}
            }
        }
        let idx = nodes.len();
        if let Some(&parent) = stack.last() {
            nodes[parent].children.push(idx);
        }
        nodes.push(node);
        idx
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"node" => {
                let idx = push_node(&mut nodes, &stack, &e);
                stack.push(idx);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"node" => {
                push_node(&mut nodes, &stack, &e);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"node" => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "ui hierarchy XML parse error");
                return None;
            }
        }
    }

    if nodes.is_empty() {
        None
    } else {
        Some(Tree { nodes })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output element
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One interactive element as presented to the LLM.
#[derive(Debug, Clone, Serialize)]
pub struct UiElement {
    /// 1-based, row-major by center.
    pub index: usize,
    pub role: String,
    pub text: String,
    /// Pixel center.
    #[serde(skip)]
    pub center_px: (i64, i64),
    /// Center in normalized `[0,1000]²` space.
    pub center: [i64; 2],
    pub clickable: bool,
    pub focusable: bool,
    pub long_clickable: bool,
    pub bounds: [i64; 4],
}

/// Full structured-perception pipeline over a uiautomator dump.
pub fn parse_hierarchy(xml: &str, screen: Screen) -> Vec<UiElement> {
    let Some(tree) = parse_tree(xml) else {
        return Vec::new();
    };

    // 1. Candidates.
    let mut candidates: Vec<usize> = Vec::new();
    for (idx, node) in tree.nodes.iter().enumerate() {
        if node.bounds.is_none() {
            continue;
        }
        if node.is_interactive() {
            candidates.push(idx);
        } else if !node.display_text().is_empty() && !tree.has_interactive_ancestor(idx) {
            candidates.push(idx);
        }
    }

    // 2. Container filter.
    let boxes: Vec<BoundingBox> = candidates
        .iter()
        .map(|&i| tree.nodes[i].bounds.unwrap_or(BoundingBox {
            x1: 0,
            y1: 0,
            x2: 1,
            y2: 1,
        }))
        .collect();
    let filtered: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|&(i, &node_idx)| {
            if !tree.nodes[node_idx].display_text().is_empty() {
                return true;
            }
            let mut contained = 0;
            for (j, inner) in boxes.iter().enumerate() {
                if i == j {
                    continue;
                }
                let (iou_container, iou_inner, _) = iou(&boxes[i], inner);
                if iou_inner > 0.9 && iou_container < 0.5 {
                    contained += 1;
                }
            }
            contained <= 2
        })
        .map(|(_, &node_idx)| node_idx)
        .collect();

    // 3. De-overlap (sorted row-major, keep-first at IoU > 0.7).
    let mut sorted: Vec<usize> = filtered;
    sorted.sort_by_key(|&i| {
        let center = tree.nodes[i].bounds.map(|b| b.center()).unwrap_or((0, 0));
        (center.1, center.0)
    });
    let mut kept: Vec<usize> = Vec::new();
    for &idx in &sorted {
        let Some(bounds) = tree.nodes[idx].bounds else {
            continue;
        };
        let duplicate = kept.iter().any(|&k| {
            tree.nodes[k]
                .bounds
                .map(|other| iou(&bounds, &other).2 > 0.7)
                .unwrap_or(false)
        });
        if !duplicate {
            kept.push(idx);
        }
    }

    // 4. Indices + text aggregation.
    kept.iter()
        .enumerate()
        .map(|(i, &node_idx)| {
            let node = &tree.nodes[node_idx];
            let bounds = node.bounds.unwrap_or(BoundingBox {
                x1: 0,
                y1: 0,
                x2: 1,
                y2: 1,
            });
            let mut text = tree.aggregate_text(node_idx, 3);
            if text.is_empty() {
                text = last_class_segment(&node.class_name);
            }
            let center_px = bounds.center();
            UiElement {
                index: i + 1,
                role: last_class_segment(&node.class_name),
                text,
                center_px,
                center: normalize_point(center_px, screen),
                clickable: node.clickable,
                focusable: node.focusable,
                long_clickable: node.long_clickable,
                bounds: [bounds.x1, bounds.y1, bounds.x2, bounds.y2],
            }
        })
        .collect()
}

/// PC perception path: the client already extracted the elements; index and
/// normalize them in the same row-major order.
pub fn from_remote_elements(elements: &[RemoteElement], screen: Screen) -> Vec<UiElement> {
    let mut sorted: Vec<&RemoteElement> = elements.iter().collect();
    sorted.sort_by_key(|e| (e.center[1], e.center[0]));
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let center_px = (e.center[0], e.center[1]);
            UiElement {
                index: i + 1,
                role: if e.role.is_empty() {
                    "element".into()
                } else {
                    e.role.clone()
                },
                text: e.text.clone(),
                center_px,
                center: normalize_point(center_px, screen),
                clickable: e.clickable,
                focusable: e.focusable,
                long_clickable: false,
                bounds: [e.center[0], e.center[1], e.center[0] + 1, e.center[1] + 1],
            }
        })
        .collect()
}

/// JSON lines for the LLM prompt, normalized coordinates only.
pub fn format_elements_for_llm(elements: &[UiElement]) -> String {
    elements
        .iter()
        .map(|e| {
            serde_json::json!({
                "index": e.index,
                "role": e.role,
                "text": e.text,
                "center": e.center,
                "clickable": e.clickable,
                "focusable": e.focusable,
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn last_class_segment(class_name: &str) -> String {
    class_name
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Element")
        .to_owned()
}

fn normalize_point(center_px: (i64, i64), screen: Screen) -> [i64; 2] {
    let width = screen.width.max(1) as i64;
    let height = screen.height.max(1) as i64;
    [
        (center_px.0 * 1000 / width).clamp(0, 1000),
        (center_px.1 * 1000 / height).clamp(0, 1000),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCREEN: Screen = Screen {
        width: 1000,
        height: 2000,
    };

    fn node(attrs: &str) -> String {
        format!("<node {attrs} />")
    }

    fn hierarchy(inner: &str) -> String {
        format!(
            "<?xml version='1.0'?><hierarchy rotation=\"0\"><node bounds=\"[0,0][1000,2000]\" class=\"android.widget.FrameLayout\">{inner}</node></hierarchy>"
        )
    }

    #[test]
    fn bounds_parsing() {
        let b = parse_bounds("[10,20][110,220]").unwrap();
        assert_eq!(b.center(), (60, 120));
        assert_eq!(b.area(), 100 * 200);
        assert!(parse_bounds("[10,20][10,220]").is_none()); // zero width
        assert!(parse_bounds("garbage").is_none());
    }

    #[test]
    fn iou_disjoint_and_nested() {
        let a = BoundingBox { x1: 0, y1: 0, x2: 10, y2: 10 };
        let b = BoundingBox { x1: 20, y1: 20, x2: 30, y2: 30 };
        assert_eq!(iou(&a, &b), (0.0, 0.0, 0.0));

        let outer = BoundingBox { x1: 0, y1: 0, x2: 100, y2: 100 };
        let inner = BoundingBox { x1: 10, y1: 10, x2: 20, y2: 20 };
        let (iou_outer, iou_inner, _) = iou(&outer, &inner);
        assert!(iou_outer < 0.5);
        assert!(iou_inner > 0.9);
    }

    #[test]
    fn collects_interactive_and_free_text() {
        let xml = hierarchy(&format!(
            "{}{}",
            node("class=\"android.widget.Button\" text=\"OK\" clickable=\"true\" bounds=\"[0,0][100,100]\""),
            node("class=\"android.widget.TextView\" text=\"Standalone\" bounds=\"[0,200][100,300]\""),
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].text, "OK");
        assert_eq!(elements[1].text, "Standalone");
        assert!(elements[0].clickable);
        assert!(!elements[1].clickable);
    }

    #[test]
    fn text_under_interactive_parent_is_absorbed() {
        let xml = hierarchy(
            "<node class=\"android.widget.LinearLayout\" clickable=\"true\" bounds=\"[0,0][500,100]\">\
             <node class=\"android.widget.TextView\" text=\"Settings\" bounds=\"[10,10][200,90]\" />\
             </node>",
        );
        let elements = parse_hierarchy(&xml, SCREEN);
        assert_eq!(elements.len(), 1);
        // Parent inherits the child's text.
        assert_eq!(elements[0].text, "Settings");
    }

    #[test]
    fn textless_container_of_many_is_filtered() {
        let children: String = (0..4)
            .map(|i| {
                let y1 = i * 100;
                let y2 = y1 + 90;
                node(&format!(
                    "class=\"android.widget.Button\" text=\"b{i}\" clickable=\"true\" bounds=\"[0,{y1}][400,{y2}]\""
                ))
            })
            .collect();
        let xml = hierarchy(&format!(
            "<node class=\"android.widget.ListView\" clickable=\"true\" bounds=\"[0,0][400,400]\">{children}</node>"
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        // The wrapper disappears, the four buttons stay.
        assert_eq!(elements.len(), 4);
        assert!(elements.iter().all(|e| e.text.starts_with('b')));
    }

    #[test]
    fn overlapping_duplicates_are_dropped() {
        let xml = hierarchy(&format!(
            "{}{}",
            node("class=\"android.widget.Button\" text=\"A\" clickable=\"true\" bounds=\"[0,0][100,100]\""),
            node("class=\"android.widget.Button\" text=\"B\" clickable=\"true\" bounds=\"[2,2][100,100]\""),
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "A"); // first in sort order wins
    }

    #[test]
    fn indices_are_row_major_and_contiguous() {
        let xml = hierarchy(&format!(
            "{}{}{}",
            node("class=\"a.B1\" text=\"bottom\" clickable=\"true\" bounds=\"[0,500][100,600]\""),
            node("class=\"a.B2\" text=\"top-right\" clickable=\"true\" bounds=\"[500,0][600,100]\""),
            node("class=\"a.B3\" text=\"top-left\" clickable=\"true\" bounds=\"[0,0][100,100]\""),
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        let order: Vec<&str> = elements.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(order, vec!["top-left", "top-right", "bottom"]);
        let indices: Vec<usize> = elements.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn empty_text_falls_back_to_class_segment() {
        let xml = hierarchy(&node(
            "class=\"android.widget.ImageButton\" clickable=\"true\" bounds=\"[0,0][100,100]\"",
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        assert_eq!(elements[0].text, "ImageButton");
    }

    #[test]
    fn pipeline_is_idempotent() {
        // Feeding the pipeline's own output geometry back through the
        // de-overlap pass changes nothing.
        let xml = hierarchy(&format!(
            "{}{}{}",
            node("class=\"a.B\" text=\"one\" clickable=\"true\" bounds=\"[0,0][100,100]\""),
            node("class=\"a.B\" text=\"two\" clickable=\"true\" bounds=\"[5,5][105,105]\""),
            node("class=\"a.B\" text=\"three\" clickable=\"true\" bounds=\"[0,300][100,400]\""),
        ));
        let first = parse_hierarchy(&xml, SCREEN);
        let second = parse_hierarchy(&xml, SCREEN);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.text, b.text);
            assert_eq!(a.bounds, b.bounds);
        }
    }

    #[test]
    fn normalized_centers() {
        let xml = hierarchy(&node(
            "class=\"a.B\" text=\"mid\" clickable=\"true\" bounds=\"[400,900][600,1100]\"",
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        assert_eq!(elements[0].center, [500, 500]);
    }

    #[test]
    fn remote_elements_are_indexed_row_major() {
        let remote: Vec<RemoteElement> = serde_json::from_value(serde_json::json!([
            {"role": "button", "text": "low", "center": [10, 500], "clickable": true},
            {"role": "button", "text": "high", "center": [10, 10], "clickable": true},
        ]))
        .unwrap();
        let elements = from_remote_elements(&remote, SCREEN);
        assert_eq!(elements[0].text, "high");
        assert_eq!(elements[0].index, 1);
        assert_eq!(elements[1].text, "low");
    }

    #[test]
    fn llm_formatting_is_one_object_per_line() {
        let xml = hierarchy(&format!(
            "{}{}",
            node("class=\"a.B\" text=\"one\" clickable=\"true\" bounds=\"[0,0][100,100]\""),
            node("class=\"a.B\" text=\"two\" clickable=\"true\" bounds=\"[0,300][100,400]\""),
        ));
        let elements = parse_hierarchy(&xml, SCREEN);
        let formatted = format_elements_for_llm(&elements);
        assert_eq!(formatted.lines().count(), 2);
        assert!(formatted.lines().all(|l| l.starts_with('{')));
    }
}
