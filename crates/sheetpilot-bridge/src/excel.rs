//! Excel automation on top of [`Dispatch`], with handle tables for the
//! workbooks, sheets and ranges the client refers to.

#![cfg(windows)]

use std::collections::HashMap;

use windows::Win32::System::Variant::VARIANT;

use sheetpilot_core::{column_index_to_label, Coordinate};
use sheetpilot_protocol::{
    Alignment, BorderLineStyle, CellError, CellValue, Color, ErrorCode, FontSpec,
    HorizontalAlignment, Region, VerticalAlignment,
};

use crate::convert;
use crate::dispatch::{self, Dispatch};

/// A failed request: the category reported to the client and a message.
#[derive(Debug)]
pub struct Failure {
    pub code: ErrorCode,
    pub message: String,
}

impl Failure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::new(ErrorCode::Failed, message)
    }
}

pub type Outcome<T> = Result<T, Failure>;

// XlFileFormat
const XL_OPEN_XML_WORKBOOK: i32 = 51;
const XL_WORKBOOK_NORMAL: i32 = -4143;
const XL_CSV: i32 = 6;

/// A handed-out object and the workbook handle it belongs to.
struct Entry {
    object: Dispatch,
    workbook: u64,
}

/// Handles for one kind of COM object.
struct HandleTable {
    kind: &'static str,
    entries: HashMap<u64, Entry>,
}

impl HandleTable {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    fn entry(&self, handle: u64) -> Outcome<&Entry> {
        self.entries.get(&handle).ok_or_else(|| self.unknown(handle))
    }

    fn get(&self, handle: u64) -> Outcome<&Dispatch> {
        Ok(&self.entry(handle)?.object)
    }

    fn owner(&self, handle: u64) -> Outcome<u64> {
        Ok(self.entry(handle)?.workbook)
    }

    fn remove(&mut self, handle: u64) -> Outcome<Dispatch> {
        self.entries
            .remove(&handle)
            .map(|entry| entry.object)
            .ok_or_else(|| self.unknown(handle))
    }

    /// Existing handle for the same COM object.
    fn find(&self, object: &Dispatch) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.object.same_object(object))
            .map(|(handle, _)| *handle)
    }

    /// Release every entry owned by `workbook`; returns how many went.
    fn drop_workbook(&mut self, workbook: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.workbook != workbook);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn unknown(&self, handle: u64) -> Failure {
        Failure::new(
            ErrorCode::UnknownHandle,
            format!("Unknown {} handle: {handle}", self.kind),
        )
    }
}

/// One `Excel.Application` instance and the objects handed out for it.
pub struct ExcelApp {
    app: Dispatch,
    workbooks: HandleTable,
    sheets: HandleTable,
    ranges: HandleTable,
    next_handle: u64,
}

impl ExcelApp {
    pub fn launch(visible: bool, display_alerts: bool) -> Result<Self, String> {
        let app = Dispatch::create("Excel.Application")?;
        app.put("Visible", dispatch::from_bool(visible))?;
        app.put("DisplayAlerts", dispatch::from_bool(display_alerts))?;

        Ok(Self {
            app,
            workbooks: HandleTable::new("workbook"),
            sheets: HandleTable::new("sheet"),
            ranges: HandleTable::new("range"),
            next_handle: 1,
        })
    }

    /// Hand out a handle for `object`, owned by `workbook`. A workbook owns
    /// itself: pass `None`.
    fn allocate(&mut self, object: Dispatch, kind: Kind, workbook: Option<u64>) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        let table = match kind {
            Kind::Workbook => &mut self.workbooks,
            Kind::Sheet => &mut self.sheets,
            Kind::Range => &mut self.ranges,
        };
        let workbook = workbook.unwrap_or(handle);
        table.entries.insert(handle, Entry { object, workbook });
        handle
    }

    /// One handle per sheet: a sheet already handed out keeps its handle.
    fn sheet_handle(&mut self, sheet: Dispatch, workbook: u64) -> u64 {
        match self.sheets.find(&sheet) {
            Some(handle) => handle,
            None => self.allocate(sheet, Kind::Sheet, Some(workbook)),
        }
    }

    // -- Lifecycle --

    pub fn window_handle(&self) -> Outcome<i64> {
        Ok(self.app.get_i64("Hwnd")?)
    }

    /// Ask Excel to quit and drop every object reference we hold.
    pub fn quit(self) -> Outcome<()> {
        let result = self.app.call("Quit", &[]);
        // Handle tables drop here, releasing their COM references.
        drop(self.ranges);
        drop(self.sheets);
        drop(self.workbooks);
        result?;
        Ok(())
    }

    // -- Workbooks --

    pub fn create_workbook(&mut self) -> Outcome<u64> {
        let workbook = self.app.child("Workbooks")?.call_child("Add", &[])?;
        Ok(self.allocate(workbook, Kind::Workbook, None))
    }

    pub fn open_workbook(&mut self, path: &str) -> Outcome<u64> {
        let workbook = self
            .app
            .child("Workbooks")?
            .call_child("Open", &[dispatch::from_str(path)])?;
        Ok(self.allocate(workbook, Kind::Workbook, None))
    }

    pub fn save_workbook(&self, workbook: u64, path: &str) -> Outcome<()> {
        let lower = path.to_ascii_lowercase();
        let format = if lower.ends_with(".xls") {
            XL_WORKBOOK_NORMAL
        } else if lower.ends_with(".csv") {
            XL_CSV
        } else {
            XL_OPEN_XML_WORKBOOK
        };
        self.workbooks.get(workbook)?.call(
            "SaveAs",
            &[dispatch::from_str(path), dispatch::from_i32(format)],
        )?;
        Ok(())
    }

    /// Sheets and ranges of the workbook go with it.
    pub fn close_workbook(&mut self, workbook: u64) -> Outcome<()> {
        let object = self.workbooks.remove(workbook)?;
        let ranges = self.ranges.drop_workbook(workbook);
        let sheets = self.sheets.drop_workbook(workbook);
        crate::log(&format!(
            "closing workbook {workbook}: released {sheets} sheet and {ranges} range handles \
             ({} sheets, {} ranges still live)",
            self.sheets.len(),
            self.ranges.len()
        ));
        object.call("Close", &[dispatch::from_bool(false)])?;
        Ok(())
    }

    // -- Sheets --

    /// `Sheets` rather than `Worksheets`: ordinals count chart sheets too.
    fn sheets_of(&self, workbook: u64) -> Outcome<Dispatch> {
        Ok(self.workbooks.get(workbook)?.child("Sheets")?)
    }

    pub fn sheet_count(&self, workbook: u64) -> Outcome<u32> {
        let count = self.sheets_of(workbook)?.get_i64("Count")?;
        Ok(count as u32)
    }

    pub fn sheet_at(&mut self, workbook: u64, ordinal: u32) -> Outcome<u64> {
        let sheet = self
            .sheets_of(workbook)?
            .child_with("Item", &[dispatch::from_i32(ordinal as i32)])?;
        Ok(self.sheet_handle(sheet, workbook))
    }

    /// Walks the collection; `Item(name)` raises for a missing name.
    pub fn sheet_named(&mut self, workbook: u64, name: &str) -> Outcome<Option<u64>> {
        let sheets = self.sheets_of(workbook)?;
        let count = sheets.get_i64("Count")?;
        for ordinal in 1..=count {
            let sheet = sheets.child_with("Item", &[dispatch::from_i32(ordinal as i32)])?;
            if sheet.get_string("Name")? == name {
                return Ok(Some(self.sheet_handle(sheet, workbook)));
            }
        }
        Ok(None)
    }

    /// New worksheets only; `Sheets.Add` would accept a chart type as well.
    pub fn add_sheet(&mut self, workbook: u64) -> Outcome<u64> {
        let sheet = self
            .workbooks
            .get(workbook)?
            .child("Worksheets")?
            .call_child("Add", &[])?;
        Ok(self.sheet_handle(sheet, workbook))
    }

    pub fn move_sheet_after(&self, sheet: u64, after: u64) -> Outcome<()> {
        if sheet == after {
            return Ok(());
        }
        let sheet = self.sheets.get(sheet)?;
        let after = self.sheets.get(after)?;
        sheet.call("Move", &[dispatch::missing(), dispatch::from_object(after)])?;
        Ok(())
    }

    pub fn sheet_name(&self, sheet: u64) -> Outcome<String> {
        Ok(self.sheets.get(sheet)?.get_string("Name")?)
    }

    pub fn rename_sheet(&self, sheet: u64, name: &str) -> Outcome<()> {
        Ok(self.sheets.get(sheet)?.put("Name", dispatch::from_str(name))?)
    }

    pub fn activate_sheet(&self, sheet: u64) -> Outcome<()> {
        self.sheets.get(sheet)?.call("Activate", &[])?;
        Ok(())
    }

    // -- Ranges --

    pub fn range(&mut self, sheet: u64, region: &Region) -> Outcome<u64> {
        let workbook = self.sheets.owner(sheet)?;
        let range = self
            .sheets
            .get(sheet)?
            .child_with("Range", &[dispatch::from_str(&region.to_a1_string())])?;
        Ok(self.allocate(range, Kind::Range, Some(workbook)))
    }

    /// Excel reports `A1` as the used range of an empty sheet; that maps to `None`.
    pub fn used_range(&mut self, sheet: u64) -> Outcome<Option<(u64, Region)>> {
        let workbook = self.sheets.owner(sheet)?;
        let used = self.sheets.get(sheet)?.child("UsedRange")?;
        let origin = Coordinate {
            row: used.get_i64("Row")? as u32,
            column: used.get_i64("Column")? as u32,
        };
        let rows = used.child("Rows")?.get_i64("Count")? as u32;
        let columns = used.child("Columns")?.get_i64("Count")? as u32;
        let region = Region::new(origin, rows, columns).map_err(|e| e.to_string())?;

        if region.is_single_cell() && dispatch::is_empty(&used.get("Value")?) {
            return Ok(None);
        }
        let handle = self.allocate(used, Kind::Range, Some(workbook));
        Ok(Some((handle, region)))
    }

    pub fn release_range(&mut self, range: u64) -> Outcome<()> {
        self.ranges.remove(range)?;
        Ok(())
    }

    pub fn set_value(&self, range: u64, value: &CellValue) -> Outcome<()> {
        let range = self.ranges.get(range)?;
        Ok(range.put("Value", to_variant(value)?)?)
    }

    pub fn value(&self, range: u64) -> Outcome<CellValue> {
        let first = self.first_cell(range)?;
        from_variant(&first.get("Value")?)
    }

    fn first_cell(&self, range: u64) -> Outcome<Dispatch> {
        Ok(self
            .ranges
            .get(range)?
            .child_with("Item", &[dispatch::from_i32(1), dispatch::from_i32(1)])?)
    }

    pub fn merge(&self, range: u64) -> Outcome<()> {
        self.ranges.get(range)?.call("Merge", &[])?;
        Ok(())
    }

    pub fn set_alignment(
        &self,
        range: u64,
        horizontal: Option<HorizontalAlignment>,
        vertical: Option<VerticalAlignment>,
    ) -> Outcome<()> {
        let range = self.ranges.get(range)?;
        if let Some(h) = horizontal {
            range.put("HorizontalAlignment", dispatch::from_i32(h.xl_constant()))?;
        }
        if let Some(v) = vertical {
            range.put("VerticalAlignment", dispatch::from_i32(v.xl_constant()))?;
        }
        Ok(())
    }

    pub fn alignment(&self, range: u64) -> Outcome<Alignment> {
        let cell = self.first_cell(range)?;
        let horizontal = cell.get_i64("HorizontalAlignment")? as i32;
        let vertical = cell.get_i64("VerticalAlignment")? as i32;
        Ok(convert::alignment_from_xl(horizontal, vertical)?)
    }

    /// `Borders` as a whole sets every edge, inside edges included.
    pub fn set_border(&self, range: u64, style: BorderLineStyle) -> Outcome<()> {
        let borders = self.ranges.get(range)?.child("Borders")?;
        Ok(borders.put("LineStyle", dispatch::from_i32(style.xl_constant()))?)
    }

    pub fn set_font(&self, range: u64, spec: &FontSpec) -> Outcome<()> {
        let font = self.ranges.get(range)?.child("Font")?;
        if let Some(name) = &spec.name {
            font.put("Name", dispatch::from_str(name))?;
        }
        if let Some(size) = spec.size {
            font.put("Size", dispatch::from_f64(size))?;
        }
        if let Some(bold) = spec.bold {
            font.put("Bold", dispatch::from_bool(bold))?;
        }
        if let Some(italic) = spec.italic {
            font.put("Italic", dispatch::from_bool(italic))?;
        }
        if let Some(color) = spec.color {
            font.put("Color", ole_color(color))?;
        }
        Ok(())
    }

    pub fn set_interior_color(&self, range: u64, color: Color) -> Outcome<()> {
        let interior = self.ranges.get(range)?.child("Interior")?;
        Ok(interior.put("Color", ole_color(color))?)
    }

    pub fn set_number_format(&self, range: u64, format: &str) -> Outcome<()> {
        Ok(self
            .ranges
            .get(range)?
            .put("NumberFormat", dispatch::from_str(format))?)
    }

    pub fn autofit_columns(&self, range: u64) -> Outcome<()> {
        self.ranges.get(range)?.child("Columns")?.call("AutoFit", &[])?;
        Ok(())
    }

    pub fn add_comment(&self, range: u64, text: &str) -> Outcome<()> {
        let cell = self.first_cell(range)?;
        cell.call("ClearComments", &[])?;
        cell.call("AddComment", &[dispatch::from_str(text)])?;
        Ok(())
    }

    pub fn add_hyperlink(&self, range: u64, url: &str, display_text: &str) -> Outcome<()> {
        let anchor = self.ranges.get(range)?;
        let hyperlinks = anchor.child("Worksheet")?.child("Hyperlinks")?;
        // Add(Anchor, Address, SubAddress, ScreenTip, TextToDisplay)
        hyperlinks.call(
            "Add",
            &[
                dispatch::from_object(anchor),
                dispatch::from_str(url),
                dispatch::missing(),
                dispatch::missing(),
                dispatch::from_str(display_text),
            ],
        )?;
        Ok(())
    }

    /// Puts the range on the clipboard for a later [`Self::paste`].
    pub fn copy_range(&self, range: u64) -> Outcome<()> {
        self.ranges.get(range)?.call("Copy", &[])?;
        Ok(())
    }

    pub fn paste(&self, sheet: u64, destination: u64) -> Outcome<()> {
        let destination = self.ranges.get(destination)?;
        self.sheets
            .get(sheet)?
            .call("Paste", &[dispatch::from_object(destination)])?;
        Ok(())
    }

    // -- Row and column sizing --

    pub fn row_height(&self, sheet: u64, row: u32) -> Outcome<f64> {
        let row = self
            .sheets
            .get(sheet)?
            .child_with("Rows", &[dispatch::from_i32(row as i32)])?;
        Ok(row.get_f64("RowHeight")?)
    }

    pub fn set_row_height(&self, sheet: u64, first: u32, last: u32, height: f64) -> Outcome<()> {
        let rows = self
            .sheets
            .get(sheet)?
            .child_with("Rows", &[dispatch::from_str(&format!("{first}:{last}"))])?;
        Ok(rows.put("RowHeight", dispatch::from_f64(height))?)
    }

    pub fn column_width(&self, sheet: u64, column: u32) -> Outcome<f64> {
        let column = self
            .sheets
            .get(sheet)?
            .child_with("Columns", &[dispatch::from_i32(column as i32)])?;
        Ok(column.get_f64("ColumnWidth")?)
    }

    pub fn set_column_width(&self, sheet: u64, first: u32, last: u32, width: f64) -> Outcome<()> {
        let span = format!(
            "{}:{}",
            column_index_to_label(first),
            column_index_to_label(last)
        );
        let columns = self
            .sheets
            .get(sheet)?
            .child_with("Columns", &[dispatch::from_str(&span)])?;
        Ok(columns.put("ColumnWidth", dispatch::from_f64(width))?)
    }

    // -- Window --

    pub fn freeze_panes(&self, split_row: u32) -> Outcome<()> {
        let window = self.app.optional_child("ActiveWindow")?.ok_or_else(|| {
            Failure::new(ErrorCode::NoActiveWindow, "Excel has no active window")
        })?;
        window.put("FreezePanes", dispatch::from_bool(false))?;
        window.put("SplitColumn", dispatch::from_i32(0))?;
        window.put("SplitRow", dispatch::from_i32(split_row as i32))?;
        window.put("FreezePanes", dispatch::from_bool(true))?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Workbook,
    Sheet,
    Range,
}

fn ole_color(color: Color) -> VARIANT {
    dispatch::from_i32(color.to_ole())
}

fn to_variant(value: &CellValue) -> Outcome<VARIANT> {
    Ok(match value {
        CellValue::Null => dispatch::empty(),
        CellValue::Bool(b) => dispatch::from_bool(*b),
        CellValue::Number(n) => dispatch::from_f64(*n),
        CellValue::String(s) => dispatch::from_str(s),
        CellValue::Error(error) => dispatch::from_cverr(convert::cverr_for(error)?),
    })
}

fn from_variant(variant: &VARIANT) -> Outcome<CellValue> {
    Ok(if dispatch::is_empty(variant) {
        CellValue::Null
    } else if let Some(b) = dispatch::as_bool(variant) {
        CellValue::Bool(b)
    } else if let Some(n) = dispatch::as_f64(variant) {
        CellValue::Number(n)
    } else if let Some(s) = dispatch::as_string(variant) {
        CellValue::String(s)
    } else if let Some(number) = dispatch::as_cverr(variant) {
        CellValue::Error(convert::error_for(number)?)
    } else if dispatch::is_error(variant) {
        CellValue::Error(CellError::new("#VALUE!"))
    } else {
        CellValue::Null
    })
}
