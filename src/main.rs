mod app;

use color_eyre::Result;
use ironframe::ContextConfig;
use app::App;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let app = App::new(ContextConfig::from_env());
    app.run()?;

    Ok(())
}
