//! sheetpilot bridge: a Windows helper that drives Excel over COM and answers
//! window/process queries for the client, one JSON request per stdin line.
//!
//! Cross-compiled from Linux and run under WINE there. Responses go to
//! stdout; diagnostics go to stderr only.

mod convert;
#[cfg(windows)]
mod dispatch;
#[cfg(windows)]
mod excel;
#[cfg(windows)]
mod process;

#[cfg(not(windows))]
fn main() {
    eprintln!("sheetpilot-bridge must be compiled for Windows (--target x86_64-pc-windows-gnu)");
    eprintln!("and run under WINE on other platforms.");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use std::io::{self, BufRead, Write};

    use sheetpilot_protocol::{Command, ErrorCode, Request, Response, ResponseResult};

    log("starting");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut bridge = Bridge::default();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log(&format!("stdin read error: {e}"));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (response, shutdown) = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let shutdown = matches!(request.command, Command::Shutdown);
                let result = bridge.handle(&request.command);
                if let ResponseResult::Error { message, .. } = &result {
                    log(&format!("{} failed: {message}", request.command.name()));
                }
                (
                    Response {
                        id: request.id,
                        result,
                    },
                    shutdown,
                )
            }
            Err(e) => {
                log(&format!("unparseable request: {line}"));
                let result =
                    ResponseResult::error_with(ErrorCode::BadRequest, format!("Bad request: {e}"));
                (Response { id: 0, result }, false)
            }
        };

        match serde_json::to_string(&response) {
            Ok(json) => {
                let _ = writeln!(out, "{json}");
                let _ = out.flush();
            }
            Err(e) => log(&format!("failed to encode response {}: {e}", response.id)),
        }

        if shutdown {
            break;
        }
    }

    bridge.shutdown();
    log("exiting");
}

#[cfg(windows)]
fn log(message: &str) {
    eprintln!("[sheetpilot-bridge] {message}");
}

/// Bridge-wide state: the COM apartment and at most one Excel instance.
#[cfg(windows)]
#[derive(Default)]
struct Bridge {
    excel: Option<excel::ExcelApp>,
    com_initialized: bool,
}

#[cfg(windows)]
impl Bridge {
    fn handle(&mut self, command: &sheetpilot_protocol::Command) -> sheetpilot_protocol::ResponseResult {
        use sheetpilot_protocol::{Command, ResponseData, ResponseResult};

        let outcome: excel::Outcome<Option<ResponseData>> = match command {
            Command::Launch {
                visible,
                display_alerts,
            } => self.launch(*visible, *display_alerts).map(|()| None),
            Command::Quit => match self.excel.take() {
                Some(app) => app.quit().map(|()| None),
                None => Ok(None),
            },
            Command::ResolveProcessId { window } => Ok(Some(ResponseData::ProcessId {
                pid: process::resolve_process_id(*window),
            })),
            Command::TerminateProcess { pid, timeout_ms } => process::terminate(*pid, *timeout_ms)
                .map(|outcome| Some(ResponseData::Termination { outcome }))
                .map_err(excel::Failure::from),
            Command::Shutdown => {
                self.shutdown();
                Ok(None)
            }
            other => match self.excel.as_mut() {
                Some(app) => dispatch_command(app, other),
                None => Err(excel::Failure::new(
                    sheetpilot_protocol::ErrorCode::NotLaunched,
                    format!("{}: Excel is not running; send Launch first", other.name()),
                )),
            },
        };

        match outcome {
            Ok(Some(data)) => ResponseResult::data(data),
            Ok(None) => ResponseResult::ok(),
            Err(failure) => ResponseResult::error_with(failure.code, failure.message),
        }
    }

    fn launch(&mut self, visible: bool, display_alerts: bool) -> excel::Outcome<()> {
        use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};

        if self.excel.is_some() {
            return Ok(());
        }
        if !self.com_initialized {
            // Excel requires a single-threaded apartment.
            unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) }
                .ok()
                .map_err(|e| format!("CoInitializeEx failed: {e}"))?;
            self.com_initialized = true;
            log("COM initialized (STA)");
        }

        let app = excel::ExcelApp::launch(visible, display_alerts)
            .map_err(|e| format!("Failed to create Excel.Application: {e}"))?;
        log("Excel.Application created");
        self.excel = Some(app);
        Ok(())
    }

    /// Best-effort teardown; safe to call more than once.
    fn shutdown(&mut self) {
        if let Some(app) = self.excel.take() {
            log("Excel still running at shutdown, asking it to quit");
            if let Err(failure) = app.quit() {
                log(&format!("quit failed: {}", failure.message));
            }
        }
        if self.com_initialized {
            unsafe { windows::Win32::System::Com::CoUninitialize() };
            self.com_initialized = false;
            log("COM uninitialized");
        }
    }
}

/// Commands that need a live Excel instance.
#[cfg(windows)]
fn dispatch_command(
    app: &mut excel::ExcelApp,
    command: &sheetpilot_protocol::Command,
) -> excel::Outcome<Option<sheetpilot_protocol::ResponseData>> {
    use sheetpilot_protocol::{Command, ResponseData};

    let handle = |handle: u64| Some(ResponseData::Handle { handle });
    let done = |()| -> Option<ResponseData> { None };

    match command {
        Command::WindowHandle => app
            .window_handle()
            .map(|window| Some(ResponseData::Window { window })),

        Command::CreateWorkbook => app.create_workbook().map(handle),
        Command::OpenWorkbook { path } => app.open_workbook(path).map(handle),
        Command::SaveWorkbook { workbook, path } => app.save_workbook(*workbook, path).map(done),
        Command::CloseWorkbook { workbook } => app.close_workbook(*workbook).map(done),

        Command::SheetCount { workbook } => app
            .sheet_count(*workbook)
            .map(|count| Some(ResponseData::Count { count })),
        Command::SheetAt { workbook, ordinal } => app.sheet_at(*workbook, *ordinal).map(handle),
        Command::SheetNamed { workbook, name } => app
            .sheet_named(*workbook, name)
            .map(|handle| Some(ResponseData::MaybeHandle { handle })),
        Command::AddSheet { workbook } => app.add_sheet(*workbook).map(handle),
        Command::MoveSheetAfter { sheet, after } => app.move_sheet_after(*sheet, *after).map(done),
        Command::SheetName { sheet } => app
            .sheet_name(*sheet)
            .map(|name| Some(ResponseData::Name { name })),
        Command::RenameSheet { sheet, name } => app.rename_sheet(*sheet, name).map(done),
        Command::ActivateSheet { sheet } => app.activate_sheet(*sheet).map(done),

        Command::Range { sheet, region } => app.range(*sheet, region).map(handle),
        Command::UsedRange { sheet } => app
            .used_range(*sheet)
            .map(|range| Some(ResponseData::UsedRange { range })),
        Command::ReleaseRange { range } => app.release_range(*range).map(done),
        Command::SetValue { range, value } => app.set_value(*range, value).map(done),
        Command::GetValue { range } => app
            .value(*range)
            .map(|value| Some(ResponseData::Value { value })),
        Command::Merge { range } => app.merge(*range).map(done),
        Command::SetAlignment {
            range,
            horizontal,
            vertical,
        } => app.set_alignment(*range, *horizontal, *vertical).map(done),
        Command::GetAlignment { range } => app
            .alignment(*range)
            .map(|alignment| Some(ResponseData::Alignment { alignment })),
        Command::SetBorder { range, style } => app.set_border(*range, *style).map(done),
        Command::SetFont { range, font } => app.set_font(*range, font).map(done),
        Command::SetInteriorColor { range, color } => {
            app.set_interior_color(*range, *color).map(done)
        }
        Command::SetNumberFormat { range, format } => {
            app.set_number_format(*range, format).map(done)
        }
        Command::AutoFitColumns { range } => app.autofit_columns(*range).map(done),
        Command::AddComment { range, text } => app.add_comment(*range, text).map(done),
        Command::AddHyperlink {
            range,
            url,
            display_text,
        } => app.add_hyperlink(*range, url, display_text).map(done),
        Command::CopyRange { range } => app.copy_range(*range).map(done),
        Command::Paste { sheet, destination } => app.paste(*sheet, *destination).map(done),

        Command::RowHeight { sheet, row } => app
            .row_height(*sheet, *row)
            .map(|size| Some(ResponseData::Size { size })),
        Command::SetRowHeight {
            sheet,
            first_row,
            last_row,
            height,
        } => app
            .set_row_height(*sheet, *first_row, *last_row, *height)
            .map(done),
        Command::ColumnWidth { sheet, column } => app
            .column_width(*sheet, *column)
            .map(|size| Some(ResponseData::Size { size })),
        Command::SetColumnWidth {
            sheet,
            first_column,
            last_column,
            width,
        } => app
            .set_column_width(*sheet, *first_column, *last_column, *width)
            .map(done),

        Command::FreezePanes { split_row } => app.freeze_panes(*split_row).map(done),

        Command::Launch { .. }
        | Command::Quit
        | Command::ResolveProcessId { .. }
        | Command::TerminateProcess { .. }
        | Command::Shutdown => Ok(None),
    }
}
