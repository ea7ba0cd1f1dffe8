use anyhow::bail;
use clap::Parser;
use cowgnition::{AuthMode, Config, RtmService, Task, TaskPage};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::ExitCode;

const APP_NAME: &str = "cowgnition";
const SETTINGS_ID: &str = "config";

#[derive(Serialize, Deserialize, Default)]
/// cowgnition tool user configuration.
/// This is intended to be user-editable.
pub struct CliSettings {
    /// The rememberthemilk API key.  RTM_API_KEY overrides this.
    pub api_key: String,
    /// The rememberthemilk shared secret.  RTM_SHARED_SECRET overrides this.
    pub shared_secret: String,
}

#[derive(Parser, Debug)]
enum Command {
    /// Authorise the app with a rememberthemilk account
    Auth {
        #[clap(long)]
        /// Skip the local callback listener and complete by hand.
        manual: bool,
    },
    /// Save the application API key and shared secret
    Credentials { key: String, secret: String },
    /// Show tasks (the default view unless --filter is given)
    Tasks {
        #[clap(long)]
        /// Provide a filter string in RTM format.
        filter: Option<String>,
    },
    /// Add a new task
    Add {
        name: String,
        #[clap(long)]
        /// Target list id; omit for the Inbox.
        list: Option<String>,
        #[clap(long)]
        /// Let RTM's smart-add parser interpret the name.
        smart: bool,
    },
    /// Mark a task complete
    Complete { list_id: String, task_id: String },
    /// Delete a task
    Delete { list_id: String, task_id: String },
    /// Show all lists
    Lists,
    /// Show all tags
    Tags,
    /// Show account settings
    Settings,
    /// Remove the saved user token
    Logout,
}

#[derive(Copy, Clone, Debug)]
enum ColourOption {
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for ColourOption {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<ColourOption, &'static str> {
        match s {
            "auto" => Ok(ColourOption::Auto),
            "always" => Ok(ColourOption::Always),
            "never" => Ok(ColourOption::Never),
            _ => Err("Invalid option for --colour"),
        }
    }
}

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short, long)]
    verbose: bool,

    #[clap(default_value = "auto", long)]
    colour: ColourOption,

    #[clap(subcommand)]
    cmd: Command,
}

impl Opt {
    fn get_stdout(&self) -> termcolor::StandardStream {
        use termcolor::ColorChoice;
        let choice = match self.colour {
            ColourOption::Auto => ColorChoice::Auto,
            ColourOption::Always => ColorChoice::Always,
            ColourOption::Never => ColorChoice::Never,
        };
        termcolor::StandardStream::stdout(choice)
    }
}

async fn get_service(mode: AuthMode) -> Result<RtmService, anyhow::Error> {
    let saved: CliSettings = confy::load(APP_NAME, Some(SETTINGS_ID))?;
    let mut config = Config::new(saved.api_key, saved.shared_secret).with_env_credentials();
    config.mode = mode;
    if config.api_key.is_empty() || config.shared_secret.is_empty() {
        eprintln!("Error, no API key saved.  Use `cowgnition credentials` to supply them.");
        bail!("no API credentials");
    }
    Ok(RtmService::new(config).await?)
}

async fn authenticated_service() -> Result<RtmService, anyhow::Error> {
    let service = get_service(AuthMode::Headless).await?;
    if !service.auth_state().authenticated {
        bail!("Not authenticated.  Run `cowgnition auth` first.");
    }
    Ok(service)
}

async fn auth(manual: bool) -> Result<ExitCode, anyhow::Error> {
    let service = get_service(AuthMode::Interactive).await?;
    if service.auth_state().authenticated {
        println!(
            "Already authenticated as {}.",
            service.auth_state().username
        );
        return Ok(ExitCode::SUCCESS);
    }

    if manual {
        let flow = service.start_auth().await?;
        println!("auth_url: {}", flow.url);
        println!("Press enter when authorised...");
        {
            use std::io::BufRead;
            let stdin = std::io::stdin();
            let mut lines = stdin.lock().lines();
            lines.next().transpose()?;
        }
        let state = service.complete_auth(&flow.frob).await?;
        println!("Successfully authenticated as {}.", state.username);
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = service.ensure_authenticated().await?;
    if outcome.success {
        println!("Successfully authenticated as {}.", outcome.username);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", outcome.message);
        Ok(ExitCode::from(1))
    }
}

async fn save_credentials(key: String, secret: String) -> Result<ExitCode, anyhow::Error> {
    let settings = CliSettings {
        api_key: key,
        shared_secret: secret,
    };
    confy::store(APP_NAME, Some(SETTINGS_ID), settings)?;
    println!("Credentials saved.");
    Ok(ExitCode::SUCCESS)
}

fn print_task_details(
    stdout: &mut termcolor::StandardStream,
    task: &Task,
) -> Result<(), anyhow::Error> {
    writeln!(stdout, "   id: {}", task.id)?;
    if !task.tags.is_empty() {
        let tags: Vec<&str> = task.tags.iter().map(String::as_str).collect();
        writeln!(stdout, "   tags: {}", tags.join(", "))?;
    }
    if let Some(due) = task.due_date {
        if task.has_due_time {
            writeln!(stdout, "   due: {}", due)?;
        } else {
            writeln!(stdout, "   due: {}", due.date_naive())?;
        }
    }
    if let Some(estimate) = &task.estimate {
        writeln!(stdout, "   estimate: {}", estimate)?;
    }
    for note in &task.notes {
        writeln!(stdout, "   note: {}", note.text)?;
    }
    Ok(())
}

fn print_tasks(opts: &Opt, page: &TaskPage) -> Result<(), anyhow::Error> {
    use termcolor::{Color, ColorSpec, WriteColor};

    let mut stdout = opts.get_stdout();
    let mut current_list = None::<&str>;
    for task in &page.tasks {
        if current_list != Some(task.list_name.as_str()) {
            stdout.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
            if task.list_name.is_empty() {
                writeln!(stdout, "#{}", task.list_id)?;
            } else {
                writeln!(stdout, "#{}", task.list_name)?;
            }
            stdout.reset()?;
            current_list = Some(task.list_name.as_str());
        }
        let colour = match task.priority {
            1 => Some(Color::Red),
            2 => Some(Color::Yellow),
            3 => Some(Color::Cyan),
            _ => None,
        };
        if let Some(colour) = colour {
            stdout.set_color(ColorSpec::new().set_fg(Some(colour)))?;
        }
        writeln!(stdout, "  {}", task.name)?;
        stdout.reset()?;
        if opts.verbose {
            print_task_details(&mut stdout, task)?;
        }
    }
    if page.truncated || page.tasks.is_empty() {
        writeln!(stdout, "{}", page.message)?;
    }
    stdout.reset()?;
    Ok(())
}

async fn list_tasks(opts: &Opt, filter: &Option<String>) -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    let page = service.get_tasks(filter.as_deref()).await?;
    print_tasks(opts, &page)?;
    if page.tasks.is_empty() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn add_task(
    name: &str,
    list: Option<&str>,
    smart: bool,
) -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    let task = service.create_task(name, list, smart).await?;
    println!("Added task id {}", task.id);
    println!("Name: {}", task.name);
    if let Some(due) = task.due_date {
        println!("Due: {}", due);
    }
    Ok(ExitCode::SUCCESS)
}

async fn complete_task(list_id: &str, task_id: &str) -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    service.complete_task(list_id, task_id).await?;
    println!("Task completed.");
    Ok(ExitCode::SUCCESS)
}

async fn delete_task(list_id: &str, task_id: &str) -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    service.delete_task(list_id, task_id).await?;
    println!("Task deleted.");
    Ok(ExitCode::SUCCESS)
}

async fn list_lists() -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    for list in service.get_lists().await? {
        if list.smart_list {
            println!("{} (smart)", list.name);
        } else {
            println!("{}", list.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn list_tags() -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    for tag in service.get_tags().await? {
        println!("{}", tag.name);
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_settings() -> Result<ExitCode, anyhow::Error> {
    let service = authenticated_service().await?;
    let settings = service.get_settings().await?;
    println!("timezone: {}", settings.timezone);
    println!("language: {}", settings.language);
    println!("default list: {}", settings.default_list_id);
    println!("default due date: {}", settings.default_due_date);
    println!(
        "date format: {}",
        if settings.is_american_date {
            "american"
        } else {
            "european"
        }
    );
    println!(
        "time format: {}",
        if settings.is_24_hour_time { "24h" } else { "12h" }
    );
    println!("pro account: {}", settings.is_pro_account);
    Ok(ExitCode::SUCCESS)
}

async fn logout() -> Result<ExitCode, anyhow::Error> {
    let service = get_service(AuthMode::Headless).await?;
    service.clear_auth()?;
    println!("Logged out.");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::init();

    let opt = Opt::parse();
    Ok(match opt.cmd {
        Command::Auth { manual } => auth(manual).await?,
        Command::Credentials { ref key, ref secret } => {
            save_credentials(key.clone(), secret.clone()).await?
        }
        Command::Tasks { ref filter } => list_tasks(&opt, filter).await?,
        Command::Add {
            ref name,
            ref list,
            smart,
        } => add_task(name, list.as_deref(), smart).await?,
        Command::Complete {
            ref list_id,
            ref task_id,
        } => complete_task(list_id, task_id).await?,
        Command::Delete {
            ref list_id,
            ref task_id,
        } => delete_task(list_id, task_id).await?,
        Command::Lists => list_lists().await?,
        Command::Tags => list_tags().await?,
        Command::Settings => show_settings().await?,
        Command::Logout => logout().await?,
    })
}
